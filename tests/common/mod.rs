#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use content_notifier::config::{self, Config, Site};
use content_notifier::db::{self, Pool};
use content_notifier::mailer::{EmailService, MailError, OutgoingEmail};
use content_notifier::model::{ContentType, NewContentItem};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

pub async fn setup_pool() -> Pool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub fn site() -> Site {
    Site {
        name: "Example Site".into(),
        url: "https://example.com".into(),
    }
}

pub fn config() -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.site = site();
    cfg.server.cron_secret = "test-secret".into();
    cfg.app.content_dir = "/nonexistent/content".into();
    cfg.mail.retry_base_ms = 1;
    cfg.mail.retry_max_ms = 2;
    cfg
}

pub async fn seed_item(pool: &Pool, id: &str, content_type: ContentType, date: (i32, u32, u32)) {
    db::create_content_item_with_id(
        pool,
        id,
        &NewContentItem {
            slug: format!("{id}-slug"),
            content_type,
            title: format!("Post {id}"),
            description: Some("desc".into()),
            content_preview: "preview".into(),
            publish_date: Utc.with_ymd_and_hms(date.0, date.1, date.2, 0, 0, 0).unwrap(),
            content_hash: "h".into(),
            tags: vec!["rust".into()],
        },
    )
    .await
    .unwrap();
}

/// Mail service that records every message and replays scripted results.
#[derive(Clone, Default)]
pub struct RecordingMailer {
    responses: Arc<Mutex<VecDeque<Result<String, MailError>>>>,
    calls: Arc<Mutex<Vec<OutgoingEmail>>>,
    begin_runs: Arc<Mutex<u32>>,
}

impl RecordingMailer {
    pub fn with_responses(responses: Vec<Result<String, MailError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<OutgoingEmail> {
        self.calls.lock().await.clone()
    }

    pub async fn begin_runs(&self) -> u32 {
        *self.begin_runs.lock().await
    }
}

#[async_trait]
impl EmailService for RecordingMailer {
    fn provider(&self) -> &'static str {
        "recording"
    }

    async fn begin_run(&self) -> Result<(), MailError> {
        *self.begin_runs.lock().await += 1;
        Ok(())
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<String, MailError> {
        let mut calls = self.calls.lock().await;
        calls.push(email.clone());
        let n = calls.len();
        drop(calls);
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(format!("msg-{n}")))
    }
}

pub fn api_error(status: u16) -> MailError {
    MailError::Api {
        provider: "recording",
        status,
        body: "scripted".into(),
    }
}
