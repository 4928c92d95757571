use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::mime::{self, Mailbox};
use super::{AuthErrorKind, EmailService, MailError, OutgoingEmail};

const GOOGLE_OAUTH_BASE: &str = "https://oauth2.googleapis.com/";
const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/";

/// OAuth2 client credentials plus a long-lived refresh token.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Short-lived bearer token returned by the token endpoint.
#[derive(Deserialize, Clone)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct SendResponse {
    id: Option<String>,
}

pub struct GmailMailer {
    http: Client,
    oauth_base: Url,
    api_base: Url,
    credentials: OAuthCredentials,
    sender: Mailbox,
    access_token: Mutex<Option<String>>,
}

impl fmt::Debug for GmailMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GmailMailer")
            .field("oauth_base", &self.oauth_base)
            .field("api_base", &self.api_base)
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

impl GmailMailer {
    pub fn new(credentials: OAuthCredentials, sender: Mailbox) -> anyhow::Result<Self> {
        let oauth_base = Url::parse(GOOGLE_OAUTH_BASE).context("invalid default OAuth URL")?;
        let api_base = Url::parse(GMAIL_API_BASE).context("invalid default Gmail URL")?;
        Self::with_base_urls(credentials, sender, oauth_base, api_base)
    }

    /// Point the client at other endpoints (used by tests with a local mock).
    pub fn with_base_urls(
        credentials: OAuthCredentials,
        sender: Mailbox,
        oauth_base: Url,
        api_base: Url,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("content-notifier/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            oauth_base,
            api_base,
            credentials,
            sender,
            access_token: Mutex::new(None),
        })
    }

    /// Exchange the refresh token for an access token.
    #[instrument(skip_all)]
    pub async fn exchange_token(&self) -> Result<AccessToken, MailError> {
        let endpoint = self
            .oauth_base
            .join("token")
            .map_err(|e| MailError::Build(format!("invalid OAuth base URL: {e}")))?;
        let form = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", self.credentials.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let res = self.http.post(endpoint).form(&form).send().await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let kind = serde_json::from_str::<OAuthErrorBody>(&body)
                .map(|b| AuthErrorKind::from_oauth_error(&b.error))
                .unwrap_or(AuthErrorKind::Other);
            warn!(status = status.as_u16(), %kind, "OAuth token exchange refused");
            return Err(MailError::Auth {
                kind,
                status: status.as_u16(),
                body,
            });
        }

        let token: AccessToken = res
            .json()
            .await
            .map_err(|e| MailError::InvalidResponse(format!("token response: {e}")))?;
        if token.access_token.trim().is_empty() {
            return Err(MailError::InvalidResponse("empty access_token".into()));
        }
        debug!(expires_in = ?token.expires_in, "obtained access token");
        Ok(token)
    }

    async fn current_token(&self) -> Result<String, MailError> {
        let mut guard = self.access_token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.exchange_token().await?.access_token;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn refresh_token(&self) -> Result<String, MailError> {
        let token = self.exchange_token().await?.access_token;
        *self.access_token.lock().await = Some(token.clone());
        Ok(token)
    }

    pub fn build_send_request(
        &self,
        access_token: &str,
        raw: &str,
    ) -> anyhow::Result<reqwest::Request> {
        let endpoint = self
            .api_base
            .join("gmail/v1/users/me/messages/send")
            .context("invalid Gmail base URL")?;
        self.http
            .post(endpoint)
            .bearer_auth(access_token)
            .json(&json!({ "raw": raw }))
            .build()
            .context("failed to build Gmail request")
    }

    async fn post_raw(&self, access_token: &str, raw: &str) -> Result<reqwest::Response, MailError> {
        let request = self
            .build_send_request(access_token, raw)
            .map_err(|e| MailError::Build(e.to_string()))?;
        Ok(self.http.execute(request).await?)
    }
}

#[async_trait]
impl EmailService for GmailMailer {
    fn provider(&self) -> &'static str {
        "gmail"
    }

    /// Fetch a fresh access token for this run.
    async fn begin_run(&self) -> Result<(), MailError> {
        self.refresh_token().await.map(|_| ())
    }

    #[instrument(skip_all)]
    async fn send(&self, email: &OutgoingEmail) -> Result<String, MailError> {
        let message = mime::build_message(&self.sender, email)?;
        let raw = mime::encode_raw(&message);

        let token = self.current_token().await?;
        let mut res = self.post_raw(&token, &raw).await?;
        if res.status() == StatusCode::UNAUTHORIZED {
            warn!("access token rejected; refreshing once");
            let token = self.refresh_token().await?;
            res = self.post_raw(&token, &raw).await?;
        }

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Gmail send failed");
            return Err(MailError::Api {
                provider: "gmail",
                status: status.as_u16(),
                body,
            });
        }

        let payload: SendResponse = res
            .json()
            .await
            .map_err(|e| MailError::InvalidResponse(format!("send response: {e}")))?;
        match payload.id.filter(|id| !id.trim().is_empty()) {
            Some(id) => {
                info!(message_id = %id, "Gmail accepted message");
                Ok(id)
            }
            None => Err(MailError::InvalidResponse(
                "send response carried no message id".into(),
            )),
        }
    }
}
