//! Inbound webhook payloads and their conversion into mailbox messages.
//!
//! - Mailgun posts pre-parsed form fields; the Message-Id lives in a JSON
//!   header array.
//! - Cloudflare Email Workers post raw RFC 5322 content.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::email_parser::parse_raw_email;
use super::{MessageContent, RawMessage};

/// Inbound webhook, tagged by provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum InboundMail {
    Mailgun(MailgunPayload),
    Cloudflare(CloudflarePayload),
}

/// Mailgun form payload. Field names use hyphens on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailgunPayload {
    pub recipient: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default, rename = "body-html")]
    pub body_html: Option<String>,
    #[serde(default, rename = "body-plain")]
    pub body_plain: Option<String>,
    #[serde(default, rename = "stripped-html")]
    pub stripped_html: Option<String>,
    #[serde(default, rename = "message-headers")]
    pub message_headers: Option<String>,
    #[serde(default, rename = "from")]
    pub from_field: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub signature: String,
}

/// Cloudflare Email Worker JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudflarePayload {
    #[serde(rename = "from")]
    pub from_field: String,
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub timestamp: String,
    pub raw_content: String,
}

impl InboundMail {
    pub fn into_raw_message(self) -> RawMessage {
        match self {
            InboundMail::Mailgun(payload) => from_mailgun(payload),
            InboundMail::Cloudflare(payload) => from_cloudflare(payload),
        }
    }
}

fn from_mailgun(payload: MailgunPayload) -> RawMessage {
    let id = extract_message_id_from_headers(payload.message_headers.as_deref()).unwrap_or_else(
        || {
            fallback_id(&[
                &payload.subject,
                &payload.recipient,
                &payload.timestamp,
                &payload.token,
            ])
        },
    );

    let from = if payload.from_field.is_empty() {
        payload.sender
    } else {
        payload.from_field
    };

    let html = payload
        .body_html
        .filter(|s| !s.is_empty())
        .or_else(|| payload.stripped_html.filter(|s| !s.is_empty()));

    debug!(message_id = %id, has_html = html.is_some(), "mailgun_message_normalised");

    RawMessage {
        id,
        envelope_to: Some(payload.recipient.clone()),
        received_at: Utc::now(),
        content: MessageContent::Fields {
            from,
            to: payload.recipient,
            subject: payload.subject,
            text: payload.body_plain,
            html,
        },
    }
}

fn from_cloudflare(payload: CloudflarePayload) -> RawMessage {
    let id = match parse_raw_email(&payload.raw_content) {
        Ok(parsed) => parsed.message_id,
        Err(e) => {
            warn!(error = %e, "cloudflare_email_parse_failed");
            None
        }
    }
    .unwrap_or_else(|| fallback_id(&[&payload.to, &payload.raw_content]));

    debug!(message_id = %id, "cloudflare_message_normalised");

    RawMessage {
        id,
        envelope_to: Some(payload.to),
        received_at: Utc::now(),
        content: MessageContent::Rfc822 {
            raw: payload.raw_content,
        },
    }
}

/// Extract Message-Id from Mailgun's message-headers JSON string.
///
/// Mailgun provides headers as a JSON array of [name, value] pairs, e.g.:
/// `[["Message-Id", "<abc123@example.com>"], ["Subject", "Hello"], ...]`
fn extract_message_id_from_headers(message_headers: Option<&str>) -> Option<String> {
    let headers = message_headers.filter(|h| !h.is_empty())?;

    let pairs: Vec<Vec<String>> = match serde_json::from_str(headers) {
        Ok(pairs) => pairs,
        Err(e) => {
            warn!(error = %e, "mailgun_headers_parse_failed");
            return None;
        }
    };

    pairs
        .iter()
        .filter(|pair| pair.len() >= 2 && pair[0].eq_ignore_ascii_case("message-id"))
        .map(|pair| pair[1].trim().trim_matches(|c| c == '<' || c == '>').to_string())
        .find(|id| !id.is_empty())
}

/// Deterministic id for messages that carry no Message-Id.
fn fallback_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailgun(headers: Option<&str>) -> MailgunPayload {
        MailgunPayload {
            recipient: "inbox+job-42@example.com".to_string(),
            sender: "bounce@mailer.example.com".to_string(),
            subject: "Code: 123456".to_string(),
            body_html: None,
            body_plain: Some("Your code is 123456".to_string()),
            stripped_html: Some("<p>Your code</p>".to_string()),
            message_headers: headers.map(str::to_string),
            from_field: "Service <noreply@example.com>".to_string(),
            timestamp: "1700000000".to_string(),
            token: "tok".to_string(),
            signature: String::new(),
        }
    }

    #[test]
    fn test_extract_message_id_from_headers() {
        let headers = r#"[["Message-Id", "<abc123@example.com>"], ["Subject", "Hello"]]"#;
        assert_eq!(
            extract_message_id_from_headers(Some(headers)),
            Some("abc123@example.com".to_string())
        );
    }

    #[test]
    fn test_extract_message_id_case_insensitive() {
        let headers = r#"[["message-id", "<test@example.com>"]]"#;
        assert_eq!(
            extract_message_id_from_headers(Some(headers)),
            Some("test@example.com".to_string())
        );
    }

    #[test]
    fn test_extract_message_id_missing_or_invalid() {
        assert!(extract_message_id_from_headers(Some(r#"[["Subject", "x"]]"#)).is_none());
        assert!(extract_message_id_from_headers(Some("not json")).is_none());
        assert!(extract_message_id_from_headers(Some("")).is_none());
        assert!(extract_message_id_from_headers(None).is_none());
    }

    #[test]
    fn test_fallback_id_is_stable_hex() {
        let a = fallback_id(&["s", "r"]);
        assert_eq!(a, fallback_id(&["s", "r"]));
        assert_ne!(a, fallback_id(&["sr", ""]));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_mailgun_to_raw_message() {
        let message =
            InboundMail::Mailgun(mailgun(Some(r#"[["Message-Id", "<m1@example.com>"]]"#)))
                .into_raw_message();

        assert_eq!(message.id, "m1@example.com");
        assert_eq!(message.envelope_to.as_deref(), Some("inbox+job-42@example.com"));
        match message.content {
            MessageContent::Fields { from, html, .. } => {
                assert_eq!(from, "Service <noreply@example.com>");
                assert_eq!(html.as_deref(), Some("<p>Your code</p>"));
            }
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn test_mailgun_fallback_id_differs_per_delivery() {
        let a = InboundMail::Mailgun(mailgun(None)).into_raw_message();
        let mut second = mailgun(None);
        second.token = "other".to_string();
        let b = InboundMail::Mailgun(second).into_raw_message();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_cloudflare_to_raw_message() {
        let payload = CloudflarePayload {
            from_field: "sender@example.com".to_string(),
            to: "recipient@example.com".to_string(),
            subject: "Test".to_string(),
            timestamp: String::new(),
            raw_content: "Message-Id: <cf@example.com>\r\nContent-Type: text/plain\r\n\r\nOTP: 1234"
                .to_string(),
        };

        let message = InboundMail::Cloudflare(payload).into_raw_message();

        assert_eq!(message.id, "cf@example.com");
        assert!(matches!(message.content, MessageContent::Rfc822 { .. }));
    }

    #[test]
    fn test_inbound_mail_tagging() {
        let json = serde_json::to_string(&InboundMail::Mailgun(mailgun(None))).unwrap();
        assert!(json.contains("\"provider\":\"mailgun\""));
    }
}
