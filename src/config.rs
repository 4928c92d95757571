//! Configuration loader and validator for the content notifier.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub site: Site,
    pub server: Server,
    pub mail: Mail,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_content_dir")]
    pub content_dir: String,
    /// Seconds between background sync runs; `0` disables the timer.
    #[serde(default)]
    pub sync_interval_secs: u64,
}

/// Public identity of the site, used in email templates and links.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Site {
    pub name: String,
    pub url: String,
}

/// Admin HTTP server settings.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub bind: String,
    pub cron_secret: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Resend,
}

/// Outbound mail settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    pub provider: Provider,
    pub sender_email: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default)]
    pub gmail: Gmail,
    #[serde(default)]
    pub resend: Resend,
}

/// Gmail OAuth2 client credentials.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gmail {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub refresh_token: String,
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resend {
    #[serde(default)]
    pub api_key: String,
    /// `From` header; falls back to `"<site name> <sender_email>"`.
    #[serde(default)]
    pub from: String,
}

fn default_content_dir() -> String {
    "./content".into()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    10_000
}

fn redact(s: &str) -> &'static str {
    if s.is_empty() {
        "[EMPTY]"
    } else {
        "[REDACTED]"
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("bind", &self.bind)
            .field("cron_secret", &redact(&self.cron_secret))
            .finish()
    }
}

impl fmt::Debug for Gmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gmail")
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

impl fmt::Debug for Resend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resend")
            .field("api_key", &redact(&self.api_key))
            .field("from", &self.from)
            .finish()
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Database URL: `DATABASE_URL` if set, otherwise a file under `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/notifier.db", self.app.data_dir))
    }

    /// Apply environment overrides using a custom lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("GMAIL_CLIENT_ID") {
            self.mail.gmail.client_id = v;
        }
        if let Some(v) = get("GMAIL_CLIENT_SECRET") {
            self.mail.gmail.client_secret = v;
        }
        if let Some(v) = get("GMAIL_REFRESH_TOKEN") {
            self.mail.gmail.refresh_token = v;
        }
        if let Some(v) = get("GMAIL_SENDER_EMAIL") {
            self.mail.sender_email = v;
        }
        if let Some(v) = get("RESEND_API_KEY") {
            self.mail.resend.api_key = v;
        }
        if let Some(v) = get("RESEND_FROM_EMAIL") {
            self.mail.resend.from = v;
        }
        if let Some(v) = get("CRON_SECRET") {
            self.server.cron_secret = v;
        }
        if let Some(v) = get("SITE_NAME") {
            self.site.name = v;
        }
        if let Some(v) = get("SITE_URL") {
            self.site.url = v;
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_overrides(|key| std::env::var(key).ok());
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.site.name.trim().is_empty() {
        return Err(ConfigError::Invalid("site.name must be non-empty"));
    }
    if !(cfg.site.url.starts_with("http://") || cfg.site.url.starts_with("https://")) {
        return Err(ConfigError::Invalid("site.url must start with http:// or https://"));
    }

    if cfg.server.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("server.bind must be non-empty"));
    }
    if cfg.server.cron_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("server.cron_secret must be non-empty"));
    }

    if !cfg.mail.sender_email.contains('@') {
        return Err(ConfigError::Invalid("mail.sender_email must be an email address"));
    }
    if cfg.mail.max_attempts == 0 {
        return Err(ConfigError::Invalid("mail.max_attempts must be >= 1"));
    }

    match cfg.mail.provider {
        Provider::Gmail => {
            let g = &cfg.mail.gmail;
            if g.client_id.trim().is_empty() {
                return Err(ConfigError::Invalid("mail.gmail.client_id must be non-empty"));
            }
            if g.client_secret.trim().is_empty() {
                return Err(ConfigError::Invalid("mail.gmail.client_secret must be non-empty"));
            }
            if g.refresh_token.trim().is_empty() {
                return Err(ConfigError::Invalid("mail.gmail.refresh_token must be non-empty"));
            }
        }
        Provider::Resend => {
            if cfg.mail.resend.api_key.trim().is_empty() {
                return Err(ConfigError::Invalid("mail.resend.api_key must be non-empty"));
            }
        }
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  content_dir: "./content"
  sync_interval_secs: 0

site:
  name: "Example Site"
  url: "https://example.com"

server:
  bind: "127.0.0.1:8787"
  cron_secret: "CHANGE_ME"

mail:
  provider: gmail
  sender_email: "me@example.com"
  max_attempts: 3
  retry_base_ms: 500
  retry_max_ms: 10000
  gmail:
    client_id: "YOUR_CLIENT_ID.apps.googleusercontent.com"
    client_secret: "YOUR_CLIENT_SECRET"
    refresh_token: "YOUR_REFRESH_TOKEN"
  resend:
    api_key: ""
    from: ""
"#
}
