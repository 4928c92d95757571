use super::model::ContentFlagCounts;
use crate::model::{ContentItem, ContentType, NewContentItem, Subscriber};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

const CONTENT_COLUMNS: &str = "id, slug, content_type, title, description, content_preview, \
     publish_date, content_hash, tags, notification_sent, notification_count, created_at, updated_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url: {normalized}"))?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePool::connect_with(options).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn content_from_row(row: &SqliteRow) -> Result<ContentItem> {
    let content_type: String = row.get("content_type");
    let tags: String = row.get("tags");
    Ok(ContentItem {
        id: row.get("id"),
        slug: row.get("slug"),
        content_type: ContentType::parse(&content_type)
            .ok_or_else(|| anyhow!("unknown content type in store: {content_type}"))?,
        title: row.get("title"),
        description: row.get("description"),
        content_preview: row.get("content_preview"),
        publish_date: from_unix(row.get("publish_date")),
        content_hash: row.get("content_hash"),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        notification_sent: row.get::<i64, _>("notification_sent") != 0,
        notification_count: row.get("notification_count"),
        created_at: from_unix(row.get("created_at")),
        updated_at: from_unix(row.get("updated_at")),
    })
}

fn subscriber_from_row(row: &SqliteRow) -> Subscriber {
    Subscriber {
        id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        blog_updates: row.get::<i64, _>("blog_updates") != 0,
        thought_updates: row.get::<i64, _>("thought_updates") != 0,
        unsubscribe_token: row.get("unsubscribe_token"),
        created_at: from_unix(row.get("created_at")),
    }
}

// ---------------------------------------------------------------------------
// Content store
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_content_item(pool: &Pool, item: &NewContentItem) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    create_content_item_with_id(pool, &id, item).await?;
    Ok(id)
}

/// Insert a content item under a caller-chosen id.
#[instrument(skip_all, fields(id = %id, slug = %item.slug))]
pub async fn create_content_item_with_id(
    pool: &Pool,
    id: &str,
    item: &NewContentItem,
) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO content_items (id, slug, content_type, title, description, content_preview, \
         publish_date, content_hash, tags, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(&item.slug)
    .bind(item.content_type.as_str())
    .bind(&item.title)
    .bind(&item.description)
    .bind(&item.content_preview)
    .bind(item.publish_date.timestamp())
    .bind(&item.content_hash)
    .bind(serde_json::to_string(&item.tags)?)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_content_item(pool: &Pool, id: &str) -> Result<Option<ContentItem>> {
    let row = sqlx::query(&format!("SELECT {CONTENT_COLUMNS} FROM content_items WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(content_from_row).transpose()
}

/// Look an item up by its natural key. Slugs are scoped per content type.
#[instrument(skip_all)]
pub async fn get_content_item_by_slug(
    pool: &Pool,
    content_type: ContentType,
    slug: &str,
) -> Result<Option<ContentItem>> {
    let row = sqlx::query(&format!(
        "SELECT {CONTENT_COLUMNS} FROM content_items WHERE content_type = ? AND slug = ?"
    ))
    .bind(content_type.as_str())
    .bind(slug)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(content_from_row).transpose()
}

/// Overwrite an item's content fields after its source changed. The
/// notification flag and counter are left as they are: subscribers hear about
/// a post once, not once per edit.
#[instrument(skip_all, fields(id = %id))]
pub async fn update_changed_content(pool: &Pool, id: &str, item: &NewContentItem) -> Result<()> {
    sqlx::query(
        "UPDATE content_items SET title = ?, description = ?, content_preview = ?, publish_date = ?, \
         content_hash = ?, tags = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&item.title)
    .bind(&item.description)
    .bind(&item.content_preview)
    .bind(item.publish_date.timestamp())
    .bind(&item.content_hash)
    .bind(serde_json::to_string(&item.tags)?)
    .bind(Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// All content items, newest publish date first.
#[instrument(skip_all)]
pub async fn list_content_items(pool: &Pool) -> Result<Vec<ContentItem>> {
    let rows = sqlx::query(&format!(
        "SELECT {CONTENT_COLUMNS} FROM content_items ORDER BY publish_date DESC"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(content_from_row).collect()
}

/// Published items still waiting for their notification, oldest first.
#[instrument(skip_all)]
pub async fn unnotified_content(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<ContentItem>> {
    let rows = sqlx::query(&format!(
        "SELECT {CONTENT_COLUMNS} FROM content_items \
         WHERE notification_sent = 0 AND publish_date <= ? \
         ORDER BY publish_date ASC, slug ASC"
    ))
    .bind(now.timestamp())
    .fetch_all(pool)
    .await?;
    rows.iter().map(content_from_row).collect()
}

#[instrument(skip_all)]
pub async fn content_flag_counts(pool: &Pool) -> Result<ContentFlagCounts> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS total, \
         COALESCE(SUM(CASE WHEN notification_sent = 1 THEN 1 ELSE 0 END), 0) AS notified \
         FROM content_items",
    )
    .fetch_one(pool)
    .await?;
    let total: i64 = row.get("total");
    let notified: i64 = row.get("notified");
    Ok(ContentFlagCounts {
        total,
        notified,
        unnotified: total - notified,
    })
}

/// Clear the notification flag and counter on every notified item.
/// Returns the number of items reset.
#[instrument(skip_all)]
pub async fn reset_content_flags(pool: &Pool) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE content_items SET notification_sent = 0, notification_count = 0, updated_at = ? \
         WHERE notification_sent = 1",
    )
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn add_subscriber(
    pool: &Pool,
    email: &str,
    name: Option<&str>,
    blog_updates: bool,
    thought_updates: bool,
) -> Result<Subscriber> {
    let email = email.trim().to_ascii_lowercase();
    if !email.contains('@') {
        return Err(anyhow!("invalid subscriber email: {email}"));
    }
    let id = uuid::Uuid::new_v4().to_string();
    let token = uuid::Uuid::new_v4().simple().to_string();
    let row = sqlx::query(
        "INSERT INTO subscribers (id, email, name, blog_updates, thought_updates, unsubscribe_token, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(email) DO UPDATE SET name = COALESCE(excluded.name, subscribers.name), \
         blog_updates = excluded.blog_updates, thought_updates = excluded.thought_updates \
         RETURNING id, email, name, blog_updates, thought_updates, unsubscribe_token, created_at",
    )
    .bind(&id)
    .bind(&email)
    .bind(name)
    .bind(blog_updates as i64)
    .bind(thought_updates as i64)
    .bind(&token)
    .bind(Utc::now().timestamp())
    .fetch_one(pool)
    .await?;
    Ok(subscriber_from_row(&row))
}

#[instrument(skip_all)]
pub async fn list_subscribers(pool: &Pool) -> Result<Vec<Subscriber>> {
    let rows = sqlx::query(
        "SELECT id, email, name, blog_updates, thought_updates, unsubscribe_token, created_at \
         FROM subscribers ORDER BY created_at ASC, email ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(subscriber_from_row).collect())
}

/// Subscribers opted in to the given content type.
#[instrument(skip_all)]
pub async fn subscribers_for(pool: &Pool, content_type: ContentType) -> Result<Vec<Subscriber>> {
    let column = match content_type {
        ContentType::Blog => "blog_updates",
        ContentType::Thought => "thought_updates",
    };
    let rows = sqlx::query(&format!(
        "SELECT id, email, name, blog_updates, thought_updates, unsubscribe_token, created_at \
         FROM subscribers WHERE {column} = 1 ORDER BY created_at ASC, email ASC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(subscriber_from_row).collect())
}

#[instrument(skip_all)]
pub async fn count_active_subscribers(pool: &Pool) -> Result<i64> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM subscribers WHERE blog_updates = 1 OR thought_updates = 1",
    )
    .fetch_one(pool)
    .await?;
    Ok(n)
}

/// Turn off every opt-in for the subscriber owning `token`.
/// Returns `false` when the token is unknown.
#[instrument(skip_all)]
pub async fn unsubscribe(pool: &Pool, token: &str) -> Result<bool> {
    if token.trim().is_empty() {
        return Ok(false);
    }
    let res = sqlx::query(
        "UPDATE subscribers SET blog_updates = 0, thought_updates = 0 WHERE unsubscribe_token = ?",
    )
    .bind(token)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}
