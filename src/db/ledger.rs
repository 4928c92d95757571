//! Notification ledger: one row per (content item, recipient) send attempt.
//!
//! Rows move `pending` -> `sent` or `pending` -> `failed`, each transition a
//! single `UPDATE` guarded on the current status. A `sent` row always carries
//! the provider's message id, and a partial unique index allows at most one
//! `sent` row per (item, recipient).

use super::model::LedgerSummary;
use super::repo::{from_unix, Pool};
use crate::model::{LedgerEntry, NotificationStatus};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use thiserror::Error;
use tracing::{instrument, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("refusing to mark entry {0} sent without a provider message id")]
    EmptyMessageId(String),
    #[error("ledger entry {0} is not pending")]
    NotPending(String),
    #[error("content item {0} does not exist")]
    UnknownContent(String),
    #[error("a sent notification already exists for entry {0}'s content item and recipient")]
    AlreadySent(String),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// `error_message` prefix for attempts that duplicated an existing delivery.
pub const DUPLICATE_PREFIX: &str = "duplicate:";

const ENTRY_COLUMNS: &str = "id, content_item_id, recipient_email, status, provider_message_id, \
     error_message, created_at, updated_at";

fn entry_from_row(row: &SqliteRow) -> LedgerEntry {
    let status: String = row.get("status");
    LedgerEntry {
        id: row.get("id"),
        content_item_id: row.get("content_item_id"),
        recipient_email: row.get("recipient_email"),
        // The CHECK constraint keeps the column within the three known values.
        status: NotificationStatus::parse(&status).unwrap_or(NotificationStatus::Failed),
        provider_message_id: row.get("provider_message_id"),
        error_message: row.get("error_message"),
        created_at: from_unix(row.get("created_at")),
        updated_at: from_unix(row.get("updated_at")),
    }
}

/// Record a `pending` attempt and bump the item's `notification_count`.
/// Returns the new entry id.
#[instrument(skip_all, fields(content_item_id = %content_item_id))]
pub async fn record_attempt(
    pool: &Pool,
    content_item_id: &str,
    recipient: &str,
) -> Result<String, LedgerError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    let bumped = sqlx::query(
        "UPDATE content_items SET notification_count = notification_count + 1, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(content_item_id)
    .execute(&mut *tx)
    .await?;
    if bumped.rows_affected() == 0 {
        return Err(LedgerError::UnknownContent(content_item_id.to_string()));
    }
    sqlx::query(
        "INSERT INTO email_notifications (id, content_item_id, recipient_email, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(content_item_id)
    .bind(recipient)
    .bind(NotificationStatus::Pending.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(id)
}

/// Move a pending entry to `sent`, storing the provider's message id.
#[instrument(skip_all, fields(entry_id = %entry_id))]
pub async fn mark_sent(
    pool: &Pool,
    entry_id: &str,
    provider_message_id: &str,
) -> Result<(), LedgerError> {
    if provider_message_id.trim().is_empty() {
        return Err(LedgerError::EmptyMessageId(entry_id.to_string()));
    }
    let res = sqlx::query(
        "UPDATE email_notifications SET status = 'sent', provider_message_id = ?, error_message = NULL, \
         updated_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(provider_message_id)
    .bind(Utc::now().timestamp())
    .bind(entry_id)
    .execute(pool)
    .await;
    match res {
        Ok(done) if done.rows_affected() == 0 => Err(LedgerError::NotPending(entry_id.to_string())),
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(LedgerError::AlreadySent(entry_id.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

/// Move a pending entry to `failed` with the reason.
#[instrument(skip_all, fields(entry_id = %entry_id))]
pub async fn mark_failed(pool: &Pool, entry_id: &str, reason: &str) -> Result<(), LedgerError> {
    let res = sqlx::query(
        "UPDATE email_notifications SET status = 'failed', error_message = ?, updated_at = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(reason)
    .bind(Utc::now().timestamp())
    .bind(entry_id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(LedgerError::NotPending(entry_id.to_string()));
    }
    Ok(())
}

/// Close a pending entry whose mail went out although the pair already had a
/// `sent` row. The entry stays out of failure counts.
#[instrument(skip_all, fields(entry_id = %entry_id))]
pub async fn mark_duplicate(
    pool: &Pool,
    entry_id: &str,
    provider_message_id: &str,
) -> Result<(), LedgerError> {
    let reason = format!("{DUPLICATE_PREFIX} delivered again as {provider_message_id}");
    mark_failed(pool, entry_id, &reason).await
}

/// Whether `recipient` already received a confirmed notification for the item.
#[instrument(skip_all)]
pub async fn has_sent(
    pool: &Pool,
    content_item_id: &str,
    recipient: &str,
) -> Result<bool, LedgerError> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM email_notifications WHERE content_item_id = ? AND recipient_email = ? \
         AND status = 'sent' AND provider_message_id IS NOT NULL LIMIT 1",
    )
    .bind(content_item_id)
    .bind(recipient)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

/// Set `notification_sent` on the item, but only when a confirmed `sent`
/// ledger row exists for it. Returns whether the flag was set.
#[instrument(skip_all, fields(content_item_id = %content_item_id))]
pub async fn mark_content_notified(pool: &Pool, content_item_id: &str) -> Result<bool, LedgerError> {
    let res = sqlx::query(
        "UPDATE content_items SET notification_sent = 1, updated_at = ? WHERE id = ? AND EXISTS ( \
         SELECT 1 FROM email_notifications n WHERE n.content_item_id = content_items.id \
         AND n.status = 'sent' AND n.provider_message_id IS NOT NULL)",
    )
    .bind(Utc::now().timestamp())
    .bind(content_item_id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        warn!("no confirmed delivery recorded; leaving item unnotified");
    }
    Ok(res.rows_affected() > 0)
}

/// Delete `sent` rows that never received a provider message id.
/// Returns the number of rows removed.
#[instrument(skip_all)]
pub async fn delete_unconfirmed_sent(pool: &Pool) -> Result<u64, LedgerError> {
    let res = sqlx::query(
        "DELETE FROM email_notifications WHERE status = 'sent' \
         AND (provider_message_id IS NULL OR TRIM(provider_message_id) = '')",
    )
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn ledger_summary(pool: &Pool) -> Result<LedgerSummary, LedgerError> {
    let rows = sqlx::query(
        "SELECT status, COALESCE(error_message LIKE ? || '%', 0) AS duplicate, COUNT(*) AS n \
         FROM email_notifications GROUP BY status, duplicate",
    )
    .bind(DUPLICATE_PREFIX)
    .fetch_all(pool)
    .await?;
    let mut summary = LedgerSummary::default();
    for row in rows {
        let status: String = row.get("status");
        let duplicate = row.get::<i64, _>("duplicate") != 0;
        let n: i64 = row.get("n");
        match NotificationStatus::parse(&status) {
            Some(NotificationStatus::Pending) => summary.pending += n,
            Some(NotificationStatus::Sent) => summary.sent += n,
            Some(NotificationStatus::Failed) if duplicate => summary.duplicates += n,
            Some(NotificationStatus::Failed) => summary.failed += n,
            None => {}
        }
    }
    Ok(summary)
}

/// Most recent ledger entries, newest first.
#[instrument(skip_all)]
pub async fn recent_entries(pool: &Pool, limit: i64) -> Result<Vec<LedgerEntry>, LedgerError> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM email_notifications ORDER BY created_at DESC, rowid DESC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(entry_from_row).collect())
}

#[instrument(skip_all)]
pub async fn entries_for_item(
    pool: &Pool,
    content_item_id: &str,
) -> Result<Vec<LedgerEntry>, LedgerError> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM email_notifications WHERE content_item_id = ? ORDER BY rowid ASC"
    ))
    .bind(content_item_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(entry_from_row).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::{create_content_item_with_id, get_content_item, run_migrations};
    use crate::model::{ContentType, NewContentItem};
    use chrono::TimeZone;

    async fn setup_pool() -> Pool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        create_content_item_with_id(
            &pool,
            "c1",
            &NewContentItem {
                slug: "hello".into(),
                content_type: ContentType::Blog,
                title: "Hello".into(),
                description: None,
                content_preview: String::new(),
                publish_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                content_hash: String::new(),
                tags: vec![],
            },
        )
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn attempt_then_sent() {
        let pool = setup_pool().await;
        let id = record_attempt(&pool, "c1", "a@example.com").await.unwrap();
        assert!(!has_sent(&pool, "c1", "a@example.com").await.unwrap());

        mark_sent(&pool, &id, "abc123").await.unwrap();
        assert!(has_sent(&pool, "c1", "a@example.com").await.unwrap());

        let entries = entries_for_item(&pool, "c1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, NotificationStatus::Sent);
        assert_eq!(entries[0].provider_message_id.as_deref(), Some("abc123"));

        let item = get_content_item(&pool, "c1").await.unwrap().unwrap();
        assert_eq!(item.notification_count, 1);

        // A second transition is rejected.
        assert!(matches!(
            mark_failed(&pool, &id, "late").await,
            Err(LedgerError::NotPending(_))
        ));
    }

    #[tokio::test]
    async fn sent_requires_message_id() {
        let pool = setup_pool().await;
        let id = record_attempt(&pool, "c1", "a@example.com").await.unwrap();
        assert!(matches!(
            mark_sent(&pool, &id, "  ").await,
            Err(LedgerError::EmptyMessageId(_))
        ));
        let summary = ledger_summary(&pool).await.unwrap();
        assert_eq!(summary, LedgerSummary { pending: 1, ..Default::default() });
    }

    #[tokio::test]
    async fn second_sent_for_same_pair_is_rejected() {
        let pool = setup_pool().await;
        let first = record_attempt(&pool, "c1", "a@example.com").await.unwrap();
        let second = record_attempt(&pool, "c1", "a@example.com").await.unwrap();
        mark_sent(&pool, &first, "m-1").await.unwrap();
        assert!(matches!(
            mark_sent(&pool, &second, "m-2").await,
            Err(LedgerError::AlreadySent(_))
        ));
        mark_duplicate(&pool, &second, "m-2").await.unwrap();
        let third = record_attempt(&pool, "c1", "b@example.com").await.unwrap();
        mark_failed(&pool, &third, "api_error: 400").await.unwrap();

        let summary = ledger_summary(&pool).await.unwrap();
        assert_eq!(
            summary,
            LedgerSummary { pending: 0, sent: 1, failed: 1, duplicates: 1 }
        );
        let entries = entries_for_item(&pool, "c1").await.unwrap();
        assert_eq!(
            entries[1].error_message.as_deref(),
            Some("duplicate: delivered again as m-2")
        );
    }

    #[tokio::test]
    async fn unknown_content_is_rejected() {
        let pool = setup_pool().await;
        assert!(matches!(
            record_attempt(&pool, "missing", "a@example.com").await,
            Err(LedgerError::UnknownContent(_))
        ));
    }

    #[tokio::test]
    async fn notified_flag_requires_confirmed_delivery() {
        let pool = setup_pool().await;
        assert!(!mark_content_notified(&pool, "c1").await.unwrap());

        let id = record_attempt(&pool, "c1", "a@example.com").await.unwrap();
        mark_failed(&pool, &id, "boom").await.unwrap();
        assert!(!mark_content_notified(&pool, "c1").await.unwrap());

        let id = record_attempt(&pool, "c1", "a@example.com").await.unwrap();
        mark_sent(&pool, &id, "m-1").await.unwrap();
        assert!(mark_content_notified(&pool, "c1").await.unwrap());
        assert!(get_content_item(&pool, "c1").await.unwrap().unwrap().notification_sent);
    }

    #[tokio::test]
    async fn repair_deletes_only_unconfirmed_sent_rows() {
        let pool = setup_pool().await;
        let good = record_attempt(&pool, "c1", "a@example.com").await.unwrap();
        mark_sent(&pool, &good, "m-1").await.unwrap();
        // Legacy rows imported without a provider id.
        sqlx::query(
            "INSERT INTO email_notifications (id, content_item_id, recipient_email, status) \
             VALUES ('legacy-1', 'c1', 'b@example.com', 'sent'), ('legacy-2', 'c1', 'c@example.com', 'sent')",
        )
        .execute(&pool)
        .await
        .unwrap();

        assert_eq!(delete_unconfirmed_sent(&pool).await.unwrap(), 2);
        let recent = recent_entries(&pool, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, good);
    }
}
