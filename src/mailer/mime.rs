//! Message assembly for the Gmail raw API.
//!
//! The message itself is built with `lettre`; this module only adds the
//! list headers and the base64url wrapping Gmail expects.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use lettre::message::header::{Header, HeaderName, HeaderValue};
use lettre::message::MultiPart;
use lettre::{Address, Message};
use std::error::Error as StdError;

pub use lettre::message::Mailbox;

use super::{MailError, OutgoingEmail};

type HeaderError = Box<dyn StdError + Send + Sync>;

/// `List-Unsubscribe: <url>`
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListUnsubscribe(String);

impl Header for ListUnsubscribe {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe")
    }

    fn parse(s: &str) -> Result<Self, HeaderError> {
        let url = s.trim().trim_start_matches('<').trim_end_matches('>');
        Ok(Self(url.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), format!("<{}>", self.0))
    }
}

/// `List-Unsubscribe-Post: List-Unsubscribe=One-Click` (RFC 8058).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListUnsubscribePost;

impl Header for ListUnsubscribePost {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe-Post")
    }

    fn parse(_s: &str) -> Result<Self, HeaderError> {
        Ok(Self)
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), "List-Unsubscribe=One-Click".to_string())
    }
}

fn strip_line_breaks(s: &str) -> String {
    s.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

fn parse_address(raw: &str) -> Result<Address, MailError> {
    strip_line_breaks(raw.trim())
        .parse::<Address>()
        .map_err(|e| MailError::Build(format!("invalid address {raw:?}: {e}")))
}

/// Sender mailbox; an empty display name yields a bare address.
pub fn sender_mailbox(name: &str, email: &str) -> Result<Mailbox, MailError> {
    let name = strip_line_breaks(name.trim());
    let name = (!name.is_empty()).then_some(name);
    Ok(Mailbox::new(name, parse_address(email)?))
}

/// Build a `multipart/alternative` message: a text part followed by an HTML part.
pub fn build_message(from: &Mailbox, email: &OutgoingEmail) -> Result<Message, MailError> {
    let to = Mailbox::new(None, parse_address(&email.to)?);
    let mut builder = Message::builder()
        .from(from.clone())
        .to(to)
        .subject(strip_line_breaks(&email.subject));
    if let Some(url) = email.unsubscribe_url.as_deref() {
        builder = builder
            .header(ListUnsubscribe(strip_line_breaks(url)))
            .header(ListUnsubscribePost);
    }
    builder
        .multipart(MultiPart::alternative_plain_html(
            email.text.clone(),
            email.html.clone(),
        ))
        .map_err(|e| MailError::Build(e.to_string()))
}

/// Unpadded base64url of the formatted message, as the Gmail `raw` field expects.
pub fn encode_raw(message: &Message) -> String {
    URL_SAFE_NO_PAD.encode(message.formatted())
}
