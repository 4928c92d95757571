use crate::db::{self, Pool};
use crate::model::ContentItem;
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

/// Published items that have not been notified yet, oldest first.
///
/// Read-only: the flag is flipped by the pipeline only after a confirmed send.
#[instrument(skip_all)]
pub async fn find_candidates(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<ContentItem>> {
    let items = db::unnotified_content(pool, now).await?;
    debug!(count = items.len(), "found notification candidates");
    Ok(items)
}
