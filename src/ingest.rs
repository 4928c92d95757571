//! Markdown content ingestion.
//!
//! Scans `<content_dir>/blog` and `<content_dir>/thoughts` for `*.md` files
//! with YAML front matter and mirrors them into the content store. Items are
//! keyed by content type and slug. Unchanged files are left alone; an edited
//! file has its fields refreshed but keeps its notification state.

use crate::db::{self, Pool};
use crate::model::{ContentType, NewContentItem};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub scanned: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrontMatter {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    publish_date: Option<String>,
    #[serde(default)]
    tags: Option<Tags>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Tags {
    List(Vec<String>),
    Csv(String),
}

impl Tags {
    fn into_vec(self) -> Vec<String> {
        let raw = match self {
            Tags::List(v) => v,
            Tags::Csv(s) => s.split(',').map(str::to_string).collect(),
        };
        raw.into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Split `---` delimited front matter from the body.
fn split_front_matter(source: &str) -> Option<(&str, &str)> {
    let source = source.strip_prefix('\u{feff}').unwrap_or(source);
    let rest = source
        .strip_prefix("---\r\n")
        .or_else(|| source.strip_prefix("---\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

/// Accepts RFC 3339, `YYYY-MM-DD` and `DD Mon YYYY`.
pub fn parse_publish_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d", "%d %b %Y", "%d %B %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn preview(body: &str) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(PREVIEW_CHARS).collect()
}

fn content_hash(title: &str, body: &str, publish_date: &DateTime<Utc>, tags: &[String]) -> String {
    let canonical = serde_json::json!({
        "title": title,
        "body": body,
        "publishDate": publish_date.to_rfc3339(),
        "tags": tags,
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

/// Parse one markdown source into a storable item.
pub fn parse_document(
    slug: &str,
    content_type: ContentType,
    source: &str,
) -> Result<NewContentItem> {
    let (yaml, body) = split_front_matter(source).context("missing front matter")?;
    let fm: FrontMatter = if yaml.trim().is_empty() {
        FrontMatter::default()
    } else {
        serde_yaml::from_str(yaml).context("invalid front matter")?
    };
    let raw_date = fm.publish_date.context("missing publishDate")?;
    let publish_date = parse_publish_date(&raw_date)
        .with_context(|| format!("unparsable publishDate: {raw_date}"))?;
    let title = fm.title.unwrap_or_default().trim().to_string();
    let tags = fm.tags.map(Tags::into_vec).unwrap_or_default();
    let body = body.trim();

    Ok(NewContentItem {
        slug: slug.to_string(),
        content_type,
        content_hash: content_hash(&title, body, &publish_date, &tags),
        title,
        description: fm
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty()),
        content_preview: preview(body),
        publish_date,
        tags,
    })
}

async fn markdown_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("md") {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Mirror every markdown file under `content_dir` into the content store.
#[instrument(skip_all, fields(content_dir = %content_dir.display()))]
pub async fn ingest_directory(pool: &Pool, content_dir: &Path) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    for (sub, content_type) in [("blog", ContentType::Blog), ("thoughts", ContentType::Thought)] {
        for path in markdown_files(&content_dir.join(sub)).await? {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') || stem.starts_with('_') {
                debug!(path = %path.display(), "skipping draft");
                continue;
            }
            report.scanned += 1;

            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(source) => parse_document(stem, content_type, &source),
                Err(err) => Err(anyhow::Error::new(err).context("unreadable file")),
            };
            let item = match parsed {
                Ok(item) => item,
                Err(err) => {
                    warn!(path = %path.display(), ?err, "skipping content file");
                    report.skipped += 1;
                    continue;
                }
            };

            match db::get_content_item_by_slug(pool, item.content_type, &item.slug).await? {
                None => {
                    db::create_content_item(pool, &item).await?;
                    report.created += 1;
                }
                Some(existing) if existing.content_hash == item.content_hash => {
                    report.unchanged += 1;
                }
                Some(existing) => {
                    db::update_changed_content(pool, &existing.id, &item).await?;
                    report.updated += 1;
                }
            }
        }
    }
    info!(
        scanned = report.scanned,
        created = report.created,
        updated = report.updated,
        skipped = report.skipped,
        "content ingested"
    );
    Ok(report)
}
