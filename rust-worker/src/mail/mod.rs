//! Mailbox side of the system.
//!
//! ```text
//! Webhooks → WebhookInbox ─poll→ MailWatcher ─filter/extract→ MailEvent → dispatcher
//! ```
//!
//! The watcher depends only on the narrow [`Mailbox`] trait; the webhook
//! inbox is one implementation of it.

pub mod email_parser;
pub mod extract;
pub mod filter;
pub mod inbox;
pub mod providers;
pub mod seen;
pub mod watcher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use email_parser::{parse_raw_email, ParsedEmail};
pub use extract::PayloadExtractor;
pub use filter::FilterRules;
pub use inbox::WebhookInbox;
pub use seen::SeenSet;
pub use watcher::{MailWatcher, WatcherHandle, WatcherHealth, WatcherSettings};

/// Credentials handed to [`Mailbox::connect`].
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub secret: Option<String>,
}

/// Message body as delivered by the mailbox, before normalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum MessageContent {
    /// Raw RFC 5322 message (headers + body).
    Rfc822 { raw: String },
    /// Provider-parsed fields.
    Fields {
        from: String,
        to: String,
        subject: String,
        text: Option<String>,
        html: Option<String>,
    },
}

/// A message as returned by [`Mailbox::poll`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Protocol-native identifier, used for acknowledgement.
    pub id: String,
    /// Envelope recipient, when the transport knows it.
    pub envelope_to: Option<String>,
    pub received_at: DateTime<Utc>,
    pub content: MessageContent,
}

/// A relevant message with its trigger payload extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailEvent {
    pub message_id: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub payload: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MailboxError {
    /// Network or protocol blip; retry.
    #[error("transient mailbox error: {0}")]
    Transient(String),

    /// The connection is gone; reconnect before retrying.
    #[error("mailbox disconnected: {0}")]
    Disconnected(String),

    /// Credentials permanently rejected.
    #[error("mailbox authentication rejected: {0}")]
    Auth(String),
}

/// Narrow mailbox client surface.
#[async_trait]
pub trait Mailbox: Send + 'static {
    async fn connect(&mut self, credentials: &Credentials) -> Result<(), MailboxError>;

    async fn poll(&mut self) -> Result<Vec<RawMessage>, MailboxError>;

    async fn acknowledge(&mut self, message_id: &str) -> Result<(), MailboxError>;

    async fn disconnect(&mut self) {}
}
