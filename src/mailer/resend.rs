use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, instrument, warn};

use super::{AuthErrorKind, EmailService, MailError, OutgoingEmail};

const RESEND_API_BASE: &str = "https://api.resend.com/";

#[derive(Serialize)]
struct SendBody<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<UnsubscribeHeaders<'a>>,
}

#[derive(Serialize)]
struct UnsubscribeHeaders<'a> {
    #[serde(rename = "List-Unsubscribe")]
    list_unsubscribe: String,
    #[serde(rename = "List-Unsubscribe-Post")]
    list_unsubscribe_post: &'a str,
}

#[derive(Deserialize)]
struct SendResponse {
    id: Option<String>,
}

pub struct ResendMailer {
    http: Client,
    base: Url,
    api_key: String,
    from: String,
}

impl fmt::Debug for ResendMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResendMailer")
            .field("base", &self.base)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl ResendMailer {
    pub fn new(api_key: String, from: String) -> anyhow::Result<Self> {
        let base = Url::parse(RESEND_API_BASE).context("invalid default Resend URL")?;
        Self::with_base_url(api_key, from, base)
    }

    pub fn with_base_url(api_key: String, from: String, base: Url) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("content-notifier/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base,
            api_key,
            from,
        })
    }

    pub fn build_request(&self, email: &OutgoingEmail) -> anyhow::Result<reqwest::Request> {
        let endpoint = self.base.join("emails").context("invalid Resend base URL")?;
        let body = SendBody {
            from: &self.from,
            to: [email.to.as_str()],
            subject: &email.subject,
            html: &email.html,
            text: &email.text,
            headers: email.unsubscribe_url.as_deref().map(|u| UnsubscribeHeaders {
                list_unsubscribe: format!("<{u}>"),
                list_unsubscribe_post: "List-Unsubscribe=One-Click",
            }),
        };
        self.http
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .build()
            .context("failed to build Resend request")
    }
}

#[async_trait]
impl EmailService for ResendMailer {
    fn provider(&self) -> &'static str {
        "resend"
    }

    #[instrument(skip_all)]
    async fn send(&self, email: &OutgoingEmail) -> Result<String, MailError> {
        if !email.to.contains('@') {
            return Err(MailError::Build(format!("invalid recipient: {}", email.to)));
        }
        let request = self
            .build_request(email)
            .map_err(|e| MailError::Build(e.to_string()))?;
        let res = self.http.execute(request).await?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = res.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Resend rejected API key");
            return Err(MailError::Auth {
                kind: AuthErrorKind::InvalidClient,
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Resend send failed");
            return Err(MailError::Api {
                provider: "resend",
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
                info!(message_id = %id, "Resend accepted message");
                Ok(id)
            }
            None => Err(MailError::InvalidResponse(
                "send response carried no message id".into(),
            )),
        }
    }
}
