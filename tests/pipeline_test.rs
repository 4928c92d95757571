mod common;

use chrono::Utc;
use common::{api_error, seed_item, setup_pool, site, RecordingMailer};
use content_notifier::db;
use content_notifier::ingest::ingest_directory;
use content_notifier::mailer::RetryPolicy;
use content_notifier::model::{ContentType, NotificationStatus};
use content_notifier::pipeline::{run_once, RunOptions};
use content_notifier::sync::find_candidates;
use std::time::Duration;

fn no_retry() -> RunOptions {
    RunOptions {
        retry: RetryPolicy::none(),
    }
}

#[tokio::test]
async fn single_item_single_subscriber_is_notified() {
    let pool = setup_pool().await;
    seed_item(&pool, "c1", ContentType::Blog, (2024, 1, 1)).await;
    db::add_subscriber(&pool, "a@example.com", None, true, true)
        .await
        .unwrap();
    let mailer = RecordingMailer::default();

    let report = run_once(&pool, &mailer, &site(), &no_retry()).await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(report.notified_items, 1);

    let item = db::get_content_item(&pool, "c1").await.unwrap().unwrap();
    assert!(item.notification_sent);
    assert_eq!(item.notification_count, 1);

    let entries = db::entries_for_item(&pool, "c1").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].content_item_id, "c1");
    assert_eq!(entries[0].recipient_email, "a@example.com");
    assert_eq!(entries[0].status, NotificationStatus::Sent);

    let calls = mailer.calls().await;
    assert_eq!(calls[0].subject, "New Blog Post: Post c1");
    assert!(calls[0].text.contains("https://example.com/blog/c1-slug"));
    assert!(calls[0]
        .unsubscribe_url
        .as_deref()
        .unwrap()
        .starts_with("https://example.com/api/user/unsubscribe?token="));
}

#[tokio::test]
async fn second_run_finds_nothing() {
    let pool = setup_pool().await;
    seed_item(&pool, "c1", ContentType::Blog, (2024, 1, 1)).await;
    seed_item(&pool, "c2", ContentType::Thought, (2024, 1, 2)).await;
    db::add_subscriber(&pool, "a@example.com", None, true, true)
        .await
        .unwrap();
    let mailer = RecordingMailer::default();

    run_once(&pool, &mailer, &site(), &no_retry()).await.unwrap();
    assert!(find_candidates(&pool, Utc::now()).await.unwrap().is_empty());

    let again = run_once(&pool, &mailer, &site(), &no_retry()).await.unwrap();
    assert_eq!(again.candidates, 0);
    assert_eq!(again.sent, 0);
    assert_eq!(mailer.calls().await.len(), 2);
    // No candidates means the provider is not even prepared.
    assert_eq!(mailer.begin_runs().await, 1);
}

#[tokio::test]
async fn provider_message_id_is_stored_and_pair_skipped_later() {
    let pool = setup_pool().await;
    seed_item(&pool, "c1", ContentType::Blog, (2024, 1, 1)).await;
    db::add_subscriber(&pool, "a@example.com", None, true, false)
        .await
        .unwrap();
    let mailer = RecordingMailer::with_responses(vec![Ok("abc123".into())]);

    run_once(&pool, &mailer, &site(), &no_retry()).await.unwrap();
    let entries = db::entries_for_item(&pool, "c1").await.unwrap();
    assert_eq!(entries[0].provider_message_id.as_deref(), Some("abc123"));

    // Clearing the flag makes the item a candidate again, but the delivered
    // pair is not sent twice.
    assert_eq!(db::reset_content_flags(&pool).await.unwrap(), 1);
    let report = run_once(&pool, &mailer, &site(), &no_retry()).await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.sent, 0);
    assert_eq!(mailer.calls().await.len(), 1);
    assert!(db::get_content_item(&pool, "c1").await.unwrap().unwrap().notification_sent);
}

#[tokio::test]
async fn notified_items_always_have_a_confirmed_send() {
    let pool = setup_pool().await;
    seed_item(&pool, "ok", ContentType::Blog, (2024, 1, 1)).await;
    seed_item(&pool, "bad", ContentType::Blog, (2024, 1, 2)).await;
    seed_item(&pool, "lonely", ContentType::Thought, (2024, 1, 3)).await;
    db::add_subscriber(&pool, "a@example.com", None, true, false)
        .await
        .unwrap();
    let mailer = RecordingMailer::with_responses(vec![Ok("m-ok".into()), Err(api_error(400))]);

    let report = run_once(&pool, &mailer, &site(), &no_retry()).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.notified_items, 1);

    let violations: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM content_items c WHERE c.notification_sent = 1 AND NOT EXISTS ( \
         SELECT 1 FROM email_notifications n WHERE n.content_item_id = c.id \
         AND n.status = 'sent' AND n.provider_message_id IS NOT NULL)",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(violations, 0);

    let unsent_with_status_sent: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM email_notifications WHERE status = 'sent' AND provider_message_id IS NULL",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(unsent_with_status_sent, 0);

    let bad = db::entries_for_item(&pool, "bad").await.unwrap();
    assert_eq!(bad[0].status, NotificationStatus::Failed);
    assert!(bad[0].error_message.as_deref().unwrap().starts_with("api_error"));
    assert!(!db::get_content_item(&pool, "lonely").await.unwrap().unwrap().notification_sent);
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let pool = setup_pool().await;
    seed_item(&pool, "c1", ContentType::Blog, (2024, 1, 1)).await;
    db::add_subscriber(&pool, "a@example.com", None, true, true)
        .await
        .unwrap();
    let mailer = RecordingMailer::with_responses(vec![Err(api_error(503)), Ok("m-2".into())]);
    let options = RunOptions {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    };

    let report = run_once(&pool, &mailer, &site(), &options).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(mailer.calls().await.len(), 2);
    // One ledger attempt covers all retries of a send.
    assert_eq!(db::entries_for_item(&pool, "c1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn subscribers_only_receive_opted_in_types() {
    let pool = setup_pool().await;
    seed_item(&pool, "post", ContentType::Blog, (2024, 1, 1)).await;
    seed_item(&pool, "idea", ContentType::Thought, (2024, 1, 2)).await;
    db::add_subscriber(&pool, "blog@example.com", None, true, false)
        .await
        .unwrap();
    db::add_subscriber(&pool, "thought@example.com", Some("Tess"), false, true)
        .await
        .unwrap();
    let mailer = RecordingMailer::default();

    let report = run_once(&pool, &mailer, &site(), &no_retry()).await.unwrap();
    assert_eq!(report.notified_items, 2);
    let calls = mailer.calls().await;
    let pairs: Vec<(String, String)> = calls
        .iter()
        .map(|c| (c.to.clone(), c.subject.clone()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("blog@example.com".to_string(), "New Blog Post: Post post".to_string()),
            ("thought@example.com".to_string(), "New Thought: Post idea".to_string()),
        ]
    );
    assert!(calls[1].text.contains("Hi Tess,"));
    assert!(calls[1].text.contains("https://example.com/thoughts/idea-slug"));
}

#[tokio::test]
async fn unsubscribed_recipients_are_not_mailed() {
    let pool = setup_pool().await;
    seed_item(&pool, "c1", ContentType::Blog, (2024, 1, 1)).await;
    let gone = db::add_subscriber(&pool, "gone@example.com", None, true, true)
        .await
        .unwrap();
    db::add_subscriber(&pool, "stay@example.com", None, true, true)
        .await
        .unwrap();
    assert!(db::unsubscribe(&pool, &gone.unsubscribe_token).await.unwrap());
    let mailer = RecordingMailer::default();

    run_once(&pool, &mailer, &site(), &no_retry()).await.unwrap();
    let to: Vec<String> = mailer.calls().await.into_iter().map(|c| c.to).collect();
    assert_eq!(to, vec!["stay@example.com".to_string()]);
}

#[tokio::test]
async fn editing_a_notified_post_does_not_resend() {
    let pool = setup_pool().await;
    db::add_subscriber(&pool, "a@example.com", None, true, true)
        .await
        .unwrap();
    let td = tempfile::tempdir().unwrap();
    let blog = td.path().join("blog");
    std::fs::create_dir_all(&blog).unwrap();
    let v1 = "---\ntitle: Hello\npublishDate: 2024-01-01\n---\nFirst version.\n";
    std::fs::write(blog.join("hello.md"), v1).unwrap();
    let mailer = RecordingMailer::default();

    ingest_directory(&pool, td.path()).await.unwrap();
    let first = run_once(&pool, &mailer, &site(), &no_retry()).await.unwrap();
    assert_eq!(first.sent, 1);

    std::fs::write(blog.join("hello.md"), v1.replace("First", "Second")).unwrap();
    let edited = ingest_directory(&pool, td.path()).await.unwrap();
    assert_eq!(edited.updated, 1);
    assert!(find_candidates(&pool, Utc::now()).await.unwrap().is_empty());

    let second = run_once(&pool, &mailer, &site(), &no_retry()).await.unwrap();
    assert_eq!(second.candidates, 0);
    assert_eq!(mailer.calls().await.len(), 1);
}
