//! Outbound email dispatch.
//!
//! [`EmailService`] is the seam the pipeline talks to. [`GmailMailer`] sends
//! through the Gmail REST API after exchanging an OAuth2 refresh token;
//! [`ResendMailer`] is the alternate provider.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::config::{Config, Provider};

pub mod gmail;
pub mod mime;
pub mod resend;

pub use gmail::{GmailMailer, OAuthCredentials};
pub use mime::{sender_mailbox, Mailbox};
pub use resend::ResendMailer;

/// Why an OAuth refresh-token exchange was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// `invalid_grant`: the refresh token was revoked or expired.
    RefreshTokenRevoked,
    /// `invalid_client` / `unauthorized_client`, or a rejected API key.
    InvalidClient,
    Other,
}

impl AuthErrorKind {
    pub fn from_oauth_error(code: &str) -> Self {
        match code {
            "invalid_grant" => AuthErrorKind::RefreshTokenRevoked,
            "invalid_client" | "unauthorized_client" => AuthErrorKind::InvalidClient,
            _ => AuthErrorKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthErrorKind::RefreshTokenRevoked => "refresh_token_revoked",
            AuthErrorKind::InvalidClient => "invalid_client",
            AuthErrorKind::Other => "other",
        }
    }

    /// Operator hint printed by diagnostics.
    pub fn hint(&self) -> &'static str {
        match self {
            AuthErrorKind::RefreshTokenRevoked => {
                "refresh token was revoked or expired; generate a new one"
            }
            AuthErrorKind::InvalidClient => "client credentials were rejected; check id and secret",
            AuthErrorKind::Other => "token endpoint refused the request",
        }
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("authentication failed ({kind}, status {status}): {body}")]
    Auth {
        kind: AuthErrorKind,
        status: u16,
        body: String,
    },
    #[error("{provider} API error {status}: {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("failed to build message: {0}")]
    Build(String),
}

impl MailError {
    /// Rate limits, provider 5xx and network failures are worth another try.
    pub fn is_retriable(&self) -> bool {
        match self {
            MailError::Api { status, .. } => *status == 429 || *status >= 500,
            MailError::Transport(err) => !err.is_builder(),
            _ => false,
        }
    }

    /// Credential failures are terminal for the whole run.
    pub fn is_auth(&self) -> bool {
        matches!(self, MailError::Auth { .. })
    }

    /// Short machine-readable label for logs and the ledger.
    pub fn code(&self) -> &'static str {
        match self {
            MailError::Auth { .. } => "auth_error",
            MailError::Api { status: 429, .. } => "rate_limited",
            MailError::Api { status, .. } if *status >= 500 => "provider_unavailable",
            MailError::Api { .. } => "api_error",
            MailError::Transport(_) => "transport_error",
            MailError::InvalidResponse(_) => "invalid_response",
            MailError::Build(_) => "build_error",
        }
    }
}

/// A composed message addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub unsubscribe_url: Option<String>,
}

#[async_trait]
pub trait EmailService: Send + Sync {
    /// Provider label used in logs.
    fn provider(&self) -> &'static str;

    /// Prepare a dispatch cycle. Providers needing short-lived credentials
    /// obtain them here, once per run.
    async fn begin_run(&self) -> Result<(), MailError> {
        Ok(())
    }

    /// Deliver one message and return the provider-assigned message id.
    async fn send(&self, email: &OutgoingEmail) -> Result<String, MailError>;
}

/// Bounded exponential backoff for transient send failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.mail.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.mail.retry_base_ms),
            max_delay: Duration::from_millis(cfg.mail.retry_max_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(10);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Send with retries on retriable errors. Non-retriable errors return at once.
#[instrument(skip_all, fields(provider = service.provider()))]
pub async fn send_with_retry(
    service: &dyn EmailService,
    email: &OutgoingEmail,
    policy: &RetryPolicy,
) -> Result<String, MailError> {
    let mut attempt = 0u32;
    loop {
        match service.send(email).await {
            Ok(id) => return Ok(id),
            Err(err) if err.is_retriable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    ?err,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "send failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Build the configured provider.
pub fn from_config(cfg: &Config) -> anyhow::Result<Arc<dyn EmailService>> {
    let sender = sender_mailbox(&cfg.site.name, &cfg.mail.sender_email)?;
    let service: Arc<dyn EmailService> = match cfg.mail.provider {
        Provider::Gmail => Arc::new(GmailMailer::new(
            OAuthCredentials {
                client_id: cfg.mail.gmail.client_id.clone(),
                client_secret: cfg.mail.gmail.client_secret.clone(),
                refresh_token: cfg.mail.gmail.refresh_token.clone(),
            },
            sender,
        )?),
        Provider::Resend => {
            let from = if cfg.mail.resend.from.trim().is_empty() {
                sender.to_string()
            } else {
                cfg.mail.resend.from.clone()
            };
            Arc::new(ResendMailer::new(cfg.mail.resend.api_key.clone(), from)?)
        }
    };
    Ok(service)
}
