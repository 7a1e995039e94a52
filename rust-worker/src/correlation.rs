//! Correlation between pending jobs and incoming mail events.
//!
//! Every operation runs under a single lock, so an event can never resolve
//! two waiting entries and an entry can never be both resolved and expired.
//! Resolution hands the event to the waiting job over a oneshot channel.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::job::JobId;
use crate::mail::MailEvent;

/// Which parts of a mail event are searched for correlation tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationField {
    Recipient,
    Subject,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// A token equals the key.
    Exact,
    /// A token starts with the key.
    Prefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchRule {
    pub field: CorrelationField,
    pub mode: MatchMode,
}

impl Default for MatchRule {
    fn default() -> Self {
        Self {
            field: CorrelationField::Any,
            mode: MatchMode::Exact,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("correlation key {0:?} is already registered")]
    DuplicateCorrelation(String),

    #[error("no waiting job matches the mail event")]
    NoMatch,
}

struct Waiting {
    job_id: JobId,
    seq: u64,
    tx: oneshot::Sender<MailEvent>,
}

#[derive(Default)]
struct IndexState {
    by_key: HashMap<String, Waiting>,
    by_job: HashMap<JobId, String>,
    next_seq: u64,
}

impl IndexState {
    fn remove_key(&mut self, key: &str) -> Option<Waiting> {
        let waiting = self.by_key.remove(key)?;
        self.by_job.remove(&waiting.job_id);
        Some(waiting)
    }

    /// Earliest-registered entry matching any token.
    fn best_match(&self, tokens: &[String], mode: MatchMode) -> Option<String> {
        let candidates: Vec<(&String, &Waiting)> = match mode {
            MatchMode::Exact => tokens
                .iter()
                .filter_map(|t| self.by_key.get_key_value(t))
                .collect(),
            MatchMode::Prefix => self
                .by_key
                .iter()
                .filter(|(key, _)| tokens.iter().any(|t| t.starts_with(key.as_str())))
                .collect(),
        };

        candidates
            .into_iter()
            .min_by_key(|(_, waiting)| waiting.seq)
            .map(|(key, _)| key.clone())
    }
}

pub struct CorrelationIndex {
    rule: MatchRule,
    state: Mutex<IndexState>,
}

impl CorrelationIndex {
    pub fn new(rule: MatchRule) -> Self {
        Self {
            rule,
            state: Mutex::new(IndexState::default()),
        }
    }

    /// Register a waiting entry; the returned receiver yields the matching event.
    pub async fn register(
        &self,
        correlation_key: &str,
        job_id: JobId,
    ) -> Result<oneshot::Receiver<MailEvent>, CorrelationError> {
        let key = normalise_key(correlation_key);
        let mut state = self.state.lock().await;

        if state.by_key.contains_key(&key) {
            return Err(CorrelationError::DuplicateCorrelation(
                correlation_key.to_string(),
            ));
        }

        let (tx, rx) = oneshot::channel();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.by_job.insert(job_id.clone(), key.clone());
        state.by_key.insert(key.clone(), Waiting { job_id: job_id.clone(), seq, tx });

        debug!(job_id = %job_id, correlation_key = %key, "correlation_registered");
        Ok(rx)
    }

    /// Consume the waiting entry matching `event` and deliver the event to it.
    pub async fn resolve(&self, event: MailEvent) -> Result<JobId, CorrelationError> {
        let tokens = candidate_tokens(&event, self.rule.field);
        let mut state = self.state.lock().await;
        let mut event = event;

        while let Some(key) = state.best_match(&tokens, self.rule.mode) {
            let Some(waiting) = state.remove_key(&key) else {
                break;
            };
            match waiting.tx.send(event) {
                Ok(()) => {
                    info!(
                        job_id = %waiting.job_id,
                        correlation_key = %key,
                        "correlation_resolved"
                    );
                    return Ok(waiting.job_id);
                }
                Err(returned) => {
                    // The job task is gone; its entry is dropped and the
                    // event offered to the next candidate.
                    warn!(job_id = %waiting.job_id, "correlation_receiver_dropped");
                    event = returned;
                }
            }
        }

        Err(CorrelationError::NoMatch)
    }

    /// Remove the waiting entry for `job_id`. Returns `false` if there was
    /// none (already resolved or expired).
    pub async fn expire(&self, job_id: &JobId) -> bool {
        let mut state = self.state.lock().await;
        let Some(key) = state.by_job.get(job_id).cloned() else {
            return false;
        };
        state.remove_key(&key);
        debug!(job_id = %job_id, correlation_key = %key, "correlation_expired");
        true
    }

    pub async fn is_waiting(&self, job_id: &JobId) -> bool {
        self.state.lock().await.by_job.contains_key(job_id)
    }

    pub async fn waiting(&self) -> usize {
        self.state.lock().await.by_key.len()
    }
}

fn normalise_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Tokens a mail event offers for matching, lowercased.
pub fn candidate_tokens(event: &MailEvent, field: CorrelationField) -> Vec<String> {
    let mut tokens = Vec::new();

    if matches!(field, CorrelationField::Recipient | CorrelationField::Any) {
        for address in event.recipient.split(',').filter_map(bare_address) {
            if let Some(tag) = extract_plus_tag(&address) {
                tokens.push(tag);
            }
            if let Some(local) = address.split('@').next() {
                tokens.push(local.to_string());
            }
            tokens.push(address);
        }
    }

    if matches!(field, CorrelationField::Subject | CorrelationField::Any) {
        let subject = event.subject.trim().to_lowercase();
        tokens.extend(
            subject
                .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        );
        if !subject.is_empty() {
            tokens.push(subject);
        }
    }

    tokens.dedup();
    tokens
}

/// `"Name <user@example.com>"` → `"user@example.com"`.
fn bare_address(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let address = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => &raw[start + 1..end],
        _ => raw,
    };
    let address = address.trim().to_lowercase();
    (!address.is_empty()).then_some(address)
}

/// Extract plus tag from an email address.
///
/// For "user+tag@example.com", returns Some("tag").
/// For "user@example.com", returns None.
fn extract_plus_tag(email: &str) -> Option<String> {
    let local = email.split('@').next()?;
    local
        .split_once('+')
        .map(|(_, tag)| tag.to_string())
        .filter(|tag| !tag.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn event(recipient: &str, subject: &str) -> MailEvent {
        MailEvent {
            message_id: "m1".to_string(),
            sender: "noreply@example.com".to_string(),
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            received_at: Utc::now(),
            payload: "123456".to_string(),
        }
    }

    #[test]
    fn test_extract_plus_tag() {
        assert_eq!(extract_plus_tag("user+tag@example.com"), Some("tag".to_string()));
        assert_eq!(extract_plus_tag("user@example.com"), None);
        assert_eq!(extract_plus_tag("user+@example.com"), None);
        assert_eq!(extract_plus_tag("user"), None);
    }

    #[test]
    fn test_candidate_tokens() {
        let tokens = candidate_tokens(
            &event("Inbox <Inbox+Job-42@Example.com>", "Code: 123456 [ref order_7]"),
            CorrelationField::Any,
        );
        assert!(tokens.contains(&"job-42".to_string()));
        assert!(tokens.contains(&"inbox+job-42@example.com".to_string()));
        assert!(tokens.contains(&"order_7".to_string()));
        assert!(tokens.contains(&"code: 123456 [ref order_7]".to_string()));

        let subject_only = candidate_tokens(&event("a+x@b.c", "hello"), CorrelationField::Subject);
        assert!(!subject_only.contains(&"x".to_string()));
    }

    #[tokio::test]
    async fn test_register_and_resolve_by_plus_tag() {
        let index = CorrelationIndex::new(MatchRule::default());
        let rx = index.register("job-42", JobId::from("job-42")).await.unwrap();

        let job = index
            .resolve(event("inbox+job-42@example.com", "Code: 123456"))
            .await
            .unwrap();

        assert_eq!(job, JobId::from("job-42"));
        assert_eq!(rx.await.unwrap().payload, "123456");
        assert_eq!(index.waiting().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let index = CorrelationIndex::new(MatchRule::default());
        let _rx = index.register("abc", JobId::from("1")).await.unwrap();
        let err = index.register("ABC ", JobId::from("2")).await.unwrap_err();
        assert_eq!(err, CorrelationError::DuplicateCorrelation("ABC ".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_is_consuming() {
        let index = CorrelationIndex::new(MatchRule::default());
        let _rx = index.register("job-1", JobId::from("1")).await.unwrap();

        assert!(index.resolve(event("x+job-1@example.com", "")).await.is_ok());
        assert_eq!(
            index.resolve(event("x+job-1@example.com", "")).await,
            Err(CorrelationError::NoMatch)
        );
    }

    #[tokio::test]
    async fn test_one_event_resolves_at_most_one_entry() {
        let index = CorrelationIndex::new(MatchRule::default());
        let _a = index.register("alpha", JobId::from("a")).await.unwrap();
        let _b = index.register("beta", JobId::from("b")).await.unwrap();

        // The subject carries both keys; only the earlier registration wins.
        let job = index.resolve(event("inbox@example.com", "beta alpha")).await.unwrap();
        assert_eq!(job, JobId::from("a"));
        assert!(index.is_waiting(&JobId::from("b")).await);
    }

    #[tokio::test]
    async fn test_prefix_mode() {
        let index = CorrelationIndex::new(MatchRule {
            field: CorrelationField::Subject,
            mode: MatchMode::Prefix,
        });
        let _rx = index.register("order-", JobId::from("o")).await.unwrap();

        let job = index.resolve(event("x@y.z", "Confirm order-981")).await.unwrap();
        assert_eq!(job, JobId::from("o"));
    }

    #[tokio::test]
    async fn test_expire_then_resolve_misses() {
        let index = CorrelationIndex::new(MatchRule::default());
        let _rx = index.register("job-9", JobId::from("9")).await.unwrap();

        assert!(index.expire(&JobId::from("9")).await);
        assert!(!index.expire(&JobId::from("9")).await);
        assert_eq!(
            index.resolve(event("a+job-9@example.com", "")).await,
            Err(CorrelationError::NoMatch)
        );
    }

    #[tokio::test]
    async fn test_dropped_receiver_skipped() {
        let index = CorrelationIndex::new(MatchRule::default());
        let dropped = index.register("k", JobId::from("gone")).await.unwrap();
        drop(dropped);

        assert_eq!(
            index.resolve(event("a+k@example.com", "")).await,
            Err(CorrelationError::NoMatch)
        );
        assert_eq!(index.waiting().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_events_resolve_once() {
        let index = Arc::new(CorrelationIndex::new(MatchRule::default()));
        let _rx = index.register("race", JobId::from("r")).await.unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let index = Arc::clone(&index);
                tokio::spawn(async move { index.resolve(event("a+race@example.com", "")).await })
            })
            .collect();

        let mut resolved = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                resolved += 1;
            }
        }
        assert_eq!(resolved, 1);
    }
}
