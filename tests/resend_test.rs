mod common;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use common::{seed_item, setup_pool, site};
use content_notifier::db;
use content_notifier::mailer::{
    AuthErrorKind, EmailService, MailError, OutgoingEmail, ResendMailer, RetryPolicy,
};
use content_notifier::model::{ContentType, NotificationStatus};
use content_notifier::pipeline::{run_once, PipelineError, RunOptions};
use reqwest::Url;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Stand-in for the Resend `/emails` endpoint.
#[derive(Default)]
struct FakeResend {
    script: Mutex<VecDeque<(u16, Value)>>,
    auth: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Value>>,
}

async fn emails(
    State(fake): State<Arc<FakeResend>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    fake.auth.lock().await.push(auth);
    fake.bodies.lock().await.push(body);
    let (status, reply) = fake
        .script
        .lock()
        .await
        .pop_front()
        .unwrap_or((200, json!({ "id": "re-default" })));
    (StatusCode::from_u16(status).unwrap(), Json(reply))
}

async fn spawn_fake(fake: Arc<FakeResend>) -> Url {
    let app = Router::new()
        .route("/emails", post(emails))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{addr}/")).unwrap()
}

async fn resend_with(script: Vec<(u16, Value)>) -> (Arc<FakeResend>, ResendMailer) {
    let fake = Arc::new(FakeResend::default());
    fake.script.lock().await.extend(script);
    let base = spawn_fake(fake.clone()).await;
    let mailer = ResendMailer::with_base_url(
        "re_test_key".into(),
        "Example Site <me@example.com>".into(),
        base,
    )
    .unwrap();
    (fake, mailer)
}

fn email() -> OutgoingEmail {
    OutgoingEmail {
        to: "a@example.com".into(),
        subject: "New Blog Post: Hello".into(),
        html: "<p>Hello</p>".into(),
        text: "Hello".into(),
        unsubscribe_url: Some("https://example.com/u?token=t".into()),
    }
}

#[tokio::test]
async fn accepted_message_returns_provider_id() {
    let (fake, mailer) = resend_with(vec![(200, json!({ "id": "re-123" }))]).await;

    let id = mailer.send(&email()).await.unwrap();
    assert_eq!(id, "re-123");
    assert_eq!(fake.auth.lock().await[0], "Bearer re_test_key");
    let body = fake.bodies.lock().await[0].clone();
    assert_eq!(body["from"], "Example Site <me@example.com>");
    assert_eq!(body["to"], json!(["a@example.com"]));
    assert_eq!(body["subject"], "New Blog Post: Hello");
    assert_eq!(body["text"], "Hello");
    assert_eq!(
        body["headers"]["List-Unsubscribe"],
        "<https://example.com/u?token=t>"
    );
}

#[tokio::test]
async fn rejected_api_key_is_an_auth_error() {
    for status in [401, 403] {
        let (_fake, mailer) =
            resend_with(vec![(status, json!({ "message": "API key is invalid" }))]).await;
        let err = mailer.send(&email()).await.unwrap_err();
        assert!(err.is_auth(), "{status}");
        assert!(!err.is_retriable());
        match err {
            MailError::Auth { kind, status: got, body } => {
                assert_eq!(kind, AuthErrorKind::InvalidClient);
                assert_eq!(got, status);
                assert!(body.contains("API key is invalid"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

#[tokio::test]
async fn response_without_id_is_invalid() {
    let (_fake, mailer) = resend_with(vec![(200, json!({ "object": "email" }))]).await;
    let err = mailer.send(&email()).await.unwrap_err();
    assert!(matches!(err, MailError::InvalidResponse(_)));
    assert_eq!(err.code(), "invalid_response");
}

#[tokio::test]
async fn validation_errors_are_not_retried() {
    let (_fake, mailer) = resend_with(vec![(422, json!({ "message": "bad to" }))]).await;
    let err = mailer.send(&email()).await.unwrap_err();
    assert!(matches!(
        err,
        MailError::Api {
            provider: "resend",
            status: 422,
            ..
        }
    ));
    assert!(!err.is_retriable());
}

#[tokio::test]
async fn rejected_key_aborts_the_run_with_failed_entry() {
    let (fake, mailer) = resend_with(vec![(401, json!({ "message": "invalid" }))]).await;
    let pool = setup_pool().await;
    seed_item(&pool, "c1", ContentType::Blog, (2024, 1, 1)).await;
    db::add_subscriber(&pool, "a@example.com", None, true, true)
        .await
        .unwrap();
    db::add_subscriber(&pool, "b@example.com", None, true, true)
        .await
        .unwrap();

    let options = RunOptions {
        retry: RetryPolicy::none(),
    };
    let err = run_once(&pool, &mailer, &site(), &options).await.unwrap_err();
    assert!(matches!(err, PipelineError::Auth(_)));
    assert_eq!(fake.bodies.lock().await.len(), 1);

    let entries = db::entries_for_item(&pool, "c1").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, NotificationStatus::Failed);
    assert!(entries[0]
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("auth_error"));
    assert!(!db::get_content_item(&pool, "c1").await.unwrap().unwrap().notification_sent);
}
