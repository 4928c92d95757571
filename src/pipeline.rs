//! One notification run: candidates -> per-subscriber send -> ledger.

use crate::config::Site;
use crate::db::{self, LedgerError, Pool};
use crate::mailer::{self, EmailService, MailError, OutgoingEmail, RetryPolicy};
use crate::model::{ContentItem, Subscriber};
use crate::sync;
use crate::template;
use chrono::Utc;
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("mail provider rejected credentials: {0}")]
    Auth(MailError),
    #[error("mail provider unavailable: {0}")]
    Mail(MailError),
}

impl PipelineError {
    fn from_mail(err: MailError) -> Self {
        if err.is_auth() {
            PipelineError::Auth(err)
        } else {
            PipelineError::Mail(err)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub retry: RetryPolicy,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub candidates: u64,
    pub notified_items: u64,
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
    pub duration_ms: u64,
}

enum Delivery {
    Sent,
    Duplicate,
    Failed,
}

/// Notify subscribers about every unnotified published item.
#[instrument(skip_all, fields(provider = mailer.provider()))]
pub async fn run_once(
    pool: &Pool,
    mailer: &dyn EmailService,
    site: &Site,
    options: &RunOptions,
) -> Result<RunReport, PipelineError> {
    let started = Instant::now();
    let candidates = sync::find_candidates(pool, Utc::now()).await?;
    let mut report = RunReport {
        candidates: candidates.len() as u64,
        ..RunReport::default()
    };
    if candidates.is_empty() {
        info!("no new content to notify");
        report.duration_ms = started.elapsed().as_millis() as u64;
        return Ok(report);
    }

    mailer.begin_run().await.map_err(|err| {
        error!(code = err.code(), %err, "could not start dispatch");
        PipelineError::from_mail(err)
    })?;

    for item in &candidates {
        let subscribers = db::subscribers_for(pool, item.content_type).await?;
        if subscribers.is_empty() {
            info!(slug = %item.slug, "no subscribers; leaving item unnotified");
            continue;
        }

        let mut delivered = 0usize;
        for subscriber in &subscribers {
            if db::has_sent(pool, &item.id, &subscriber.email).await? {
                report.skipped += 1;
                delivered += 1;
                continue;
            }
            match deliver(pool, mailer, site, options, item, subscriber).await? {
                Delivery::Sent => {
                    report.sent += 1;
                    delivered += 1;
                }
                Delivery::Duplicate => {
                    report.skipped += 1;
                    delivered += 1;
                }
                Delivery::Failed => report.failed += 1,
            }
        }

        if delivered == subscribers.len() && db::mark_content_notified(pool, &item.id).await? {
            report.notified_items += 1;
            info!(slug = %item.slug, recipients = delivered, "item notified");
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        candidates = report.candidates,
        sent = report.sent,
        failed = report.failed,
        skipped = report.skipped,
        duration_ms = report.duration_ms,
        "notification run finished"
    );
    Ok(report)
}

async fn deliver(
    pool: &Pool,
    mailer: &dyn EmailService,
    site: &Site,
    options: &RunOptions,
    item: &ContentItem,
    subscriber: &Subscriber,
) -> Result<Delivery, PipelineError> {
    let entry_id = db::record_attempt(pool, &item.id, &subscriber.email).await?;

    let rendered = match template::render(item, subscriber, site) {
        Ok(r) => r,
        Err(err) => {
            warn!(slug = %item.slug, %err, "cannot render notification");
            db::mark_failed(pool, &entry_id, &err.to_string()).await?;
            return Ok(Delivery::Failed);
        }
    };
    let email = OutgoingEmail {
        to: subscriber.email.clone(),
        subject: rendered.subject,
        html: rendered.html,
        text: rendered.text,
        unsubscribe_url: Some(template::unsubscribe_url(site, subscriber)),
    };

    match mailer::send_with_retry(mailer, &email, &options.retry).await {
        Ok(message_id) => match db::mark_sent(pool, &entry_id, &message_id).await {
            Ok(()) => Ok(Delivery::Sent),
            Err(LedgerError::AlreadySent(_)) => {
                warn!(slug = %item.slug, %message_id, "recipient already has a sent notification");
                db::mark_duplicate(pool, &entry_id, &message_id).await?;
                Ok(Delivery::Duplicate)
            }
            Err(err) => Err(err.into()),
        },
        Err(err) => {
            warn!(slug = %item.slug, code = err.code(), %err, "send failed");
            db::mark_failed(pool, &entry_id, &format!("{}: {}", err.code(), err)).await?;
            if err.is_auth() {
                return Err(PipelineError::Auth(err));
            }
            Ok(Delivery::Failed)
        }
    }
}
