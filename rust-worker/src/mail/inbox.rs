//! Webhook-fed mailbox.
//!
//! Web handlers `deliver` inbound mail; the watcher drains it through the
//! [`Mailbox`] trait. Messages stay in the inbox until acknowledged, so an
//! unacknowledged message is returned again on the next poll.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Credentials, Mailbox, MailboxError, RawMessage};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("inbox is full ({0} messages pending)")]
    Full(usize),

    #[error("inbox is closed")]
    Closed,
}

/// Shared in-process inbox.
///
/// Cloning is cheap; all clones see the same messages.
#[derive(Clone)]
pub struct WebhookInbox {
    inner: Arc<InboxInner>,
    connected: bool,
}

struct InboxInner {
    capacity: usize,
    state: Mutex<InboxState>,
}

#[derive(Default)]
struct InboxState {
    pending: VecDeque<RawMessage>,
    closed: bool,
}

impl WebhookInbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(InboxInner {
                capacity: capacity.max(1),
                state: Mutex::new(InboxState::default()),
            }),
            connected: false,
        }
    }

    /// Accept a message from a webhook.
    pub async fn deliver(&self, message: RawMessage) -> Result<(), DeliveryError> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(DeliveryError::Closed);
        }
        if state.pending.len() >= self.inner.capacity {
            warn!(pending = state.pending.len(), "inbox_full");
            return Err(DeliveryError::Full(state.pending.len()));
        }
        if state.pending.iter().any(|m| m.id == message.id) {
            debug!(message_id = %message.id, "inbox_duplicate_delivery");
            return Ok(());
        }

        debug!(message_id = %message.id, "inbox_message_delivered");
        state.pending.push_back(message);
        Ok(())
    }

    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    /// Stop accepting deliveries; subsequent polls report a disconnect.
    pub async fn close(&self) {
        self.inner.state.lock().await.closed = true;
        info!("inbox_closed");
    }
}

#[async_trait]
impl Mailbox for WebhookInbox {
    async fn connect(&mut self, _credentials: &Credentials) -> Result<(), MailboxError> {
        if self.inner.state.lock().await.closed {
            return Err(MailboxError::Disconnected("inbox closed".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<RawMessage>, MailboxError> {
        let state = self.inner.state.lock().await;
        if !self.connected || state.closed {
            self.connected = false;
            return Err(MailboxError::Disconnected("inbox not connected".to_string()));
        }
        Ok(state.pending.iter().cloned().collect())
    }

    async fn acknowledge(&mut self, message_id: &str) -> Result<(), MailboxError> {
        let mut state = self.inner.state.lock().await;
        state.pending.retain(|m| m.id != message_id);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MessageContent;
    use chrono::Utc;

    fn message(id: &str) -> RawMessage {
        RawMessage {
            id: id.to_string(),
            envelope_to: None,
            received_at: Utc::now(),
            content: MessageContent::Rfc822 {
                raw: "Subject: x\r\n\r\nbody".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_poll_requires_connect() {
        let mut inbox = WebhookInbox::new(10);
        assert!(matches!(inbox.poll().await, Err(MailboxError::Disconnected(_))));
        inbox.connect(&Credentials::default()).await.unwrap();
        assert!(inbox.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unacknowledged_messages_redelivered() {
        let mut inbox = WebhookInbox::new(10);
        inbox.connect(&Credentials::default()).await.unwrap();
        inbox.deliver(message("a")).await.unwrap();
        inbox.deliver(message("b")).await.unwrap();

        assert_eq!(inbox.poll().await.unwrap().len(), 2);
        inbox.acknowledge("a").await.unwrap();

        let again = inbox.poll().await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, "b");
    }

    #[tokio::test]
    async fn test_capacity_and_duplicates() {
        let inbox = WebhookInbox::new(1);
        inbox.deliver(message("a")).await.unwrap();
        inbox.deliver(message("a")).await.unwrap();
        assert_eq!(inbox.pending().await, 1);
        assert_eq!(inbox.deliver(message("b")).await, Err(DeliveryError::Full(1)));
    }

    #[tokio::test]
    async fn test_closed_inbox() {
        let mut inbox = WebhookInbox::new(10);
        let handle = inbox.clone();
        inbox.connect(&Credentials::default()).await.unwrap();
        handle.close().await;
        assert_eq!(handle.deliver(message("a")).await, Err(DeliveryError::Closed));
        assert!(matches!(inbox.poll().await, Err(MailboxError::Disconnected(_))));
        assert!(inbox.connect(&Credentials::default()).await.is_err());
    }
}
