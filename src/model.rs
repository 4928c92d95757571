use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Blog,
    Thought,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Blog => "blog",
            ContentType::Thought => "thought",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blog" => Some(ContentType::Blog),
            "thought" => Some(ContentType::Thought),
            _ => None,
        }
    }

    /// Path segment the site serves this content type under.
    pub fn url_segment(&self) -> &'static str {
        match self {
            ContentType::Blog => "blog",
            ContentType::Thought => "thoughts",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NotificationStatus::Pending),
            "sent" => Some(NotificationStatus::Sent),
            "failed" => Some(NotificationStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: String,
    pub slug: String,
    pub content_type: ContentType,
    pub title: String,
    pub description: Option<String>,
    pub content_preview: String,
    pub publish_date: DateTime<Utc>,
    pub content_hash: String,
    pub tags: Vec<String>,
    pub notification_sent: bool,
    pub notification_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a content item is first stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewContentItem {
    pub slug: String,
    pub content_type: ContentType,
    pub title: String,
    pub description: Option<String>,
    pub content_preview: String,
    pub publish_date: DateTime<Utc>,
    pub content_hash: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub blog_updates: bool,
    pub thought_updates: bool,
    #[serde(skip_serializing)]
    pub unsubscribe_token: String,
    pub created_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn wants(&self, content_type: ContentType) -> bool {
        match content_type {
            ContentType::Blog => self.blog_updates,
            ContentType::Thought => self.thought_updates,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: String,
    pub content_item_id: String,
    pub recipient_email: String,
    pub status: NotificationStatus,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
