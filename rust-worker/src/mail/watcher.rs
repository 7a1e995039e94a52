//! Mailbox polling loop.
//!
//! The watcher owns its mailbox connection outright. Each poll cycle:
//! 1. reconnects if needed (exponential backoff, bounded attempts)
//! 2. polls, retrying transient failures within the cycle
//! 3. drops ids already seen inside the dedup window
//! 4. parses, filters and extracts the payload exactly once per message
//! 5. emits a [`MailEvent`] for matches and acknowledges every message

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{
    Credentials, FilterRules, MailEvent, Mailbox, MailboxError, ParsedEmail, PayloadExtractor,
    RawMessage, SeenSet,
};
use crate::util::backoff;

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// Poll attempts within a single cycle.
    pub poll_attempts: u32,
    /// Connect attempts before connectivity is reported fatal.
    pub reconnect_attempts: u32,
    pub backoff_base: Duration,
    /// Consecutive failed cycles before the watcher reports unhealthy.
    pub unhealthy_after: u32,
    pub seen_window: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            poll_attempts: 3,
            reconnect_attempts: 5,
            backoff_base: Duration::from_millis(500),
            unhealthy_after: 3,
            seen_window: Duration::from_secs(3600),
        }
    }
}

/// Health signal published by the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WatcherHealth {
    Starting,
    Healthy,
    Unhealthy {
        consecutive_failures: u32,
        last_error: String,
    },
    /// Connectivity lost beyond the retry budget, or credentials rejected.
    Fatal { error: String },
    Stopped,
}

impl WatcherHealth {
    pub fn is_fatal(&self) -> bool {
        matches!(self, WatcherHealth::Fatal { .. })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatcherError {
    #[error("poll failed after {attempts} attempts: {last}")]
    PollExhausted { attempts: u32, last: MailboxError },

    #[error("reconnect failed after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: MailboxError },

    #[error("credentials rejected: {0}")]
    AuthRejected(String),
}

/// Per-cycle counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub fetched: usize,
    pub emitted: usize,
    pub duplicates: usize,
    pub filtered: usize,
    pub unmatched: usize,
}

enum Examined {
    Event(MailEvent),
    Filtered,
    NoPayload,
    Unparseable(String),
}

pub struct MailWatcher<M: Mailbox> {
    mailbox: M,
    credentials: Credentials,
    settings: WatcherSettings,
    filter: FilterRules,
    extractor: PayloadExtractor,
    seen: SeenSet,
    events: mpsc::Sender<MailEvent>,
    health: watch::Sender<WatcherHealth>,
    connected: bool,
    consecutive_failures: u32,
}

/// Handle to a running watcher task.
pub struct WatcherHandle {
    stop: watch::Sender<bool>,
    health: watch::Receiver<WatcherHealth>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn health(&self) -> WatcherHealth {
        self.health.borrow().clone()
    }

    pub fn health_receiver(&self) -> watch::Receiver<WatcherHealth> {
        self.health.clone()
    }

    /// Cooperative shutdown: an in-flight poll completes before the loop exits.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "mail_watcher_task_failed");
        }
    }
}

impl<M: Mailbox> MailWatcher<M> {
    pub fn new(
        mailbox: M,
        credentials: Credentials,
        settings: WatcherSettings,
        extractor: PayloadExtractor,
        events: mpsc::Sender<MailEvent>,
    ) -> Self {
        let (health, _) = watch::channel(WatcherHealth::Starting);
        Self {
            mailbox,
            credentials,
            seen: SeenSet::new(settings.seen_window),
            settings,
            filter: FilterRules::default(),
            extractor,
            events,
            health,
            connected: false,
            consecutive_failures: 0,
        }
    }

    pub fn health_receiver(&self) -> watch::Receiver<WatcherHealth> {
        self.health.subscribe()
    }

    /// Spawn the background polling loop.
    pub fn start(mut self, poll_interval: Duration, filter: FilterRules) -> WatcherHandle {
        self.filter = filter;
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let health = self.health.subscribe();

        let task = tokio::spawn(async move {
            info!(
                poll_interval_ms = poll_interval.as_millis() as u64,
                sender_rules = self.filter.senders.len(),
                subject_rules = self.filter.subjects.len(),
                "mail_watcher_started"
            );

            let mut tick = interval(poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = tick.tick() => {}
                }

                if let Err(WatcherError::AuthRejected(_)) = self.run_cycle().await {
                    break;
                }
            }

            self.mailbox.disconnect().await;
            // A fatal signal outlives the loop so health checks keep failing.
            self.health.send_if_modified(|health| {
                if health.is_fatal() {
                    return false;
                }
                *health = WatcherHealth::Stopped;
                true
            });
            info!("mail_watcher_stopped");
        });

        WatcherHandle {
            stop: stop_tx,
            health,
            task,
        }
    }

    /// Run one cycle and fold its outcome into the health signal.
    pub async fn run_cycle(&mut self) -> Result<CycleStats, WatcherError> {
        let result = self.poll_cycle().await;

        match &result {
            Ok(stats) => {
                if self.consecutive_failures > 0 {
                    info!(after_failures = self.consecutive_failures, "mail_watcher_recovered");
                }
                self.consecutive_failures = 0;
                self.health.send_replace(WatcherHealth::Healthy);
                if stats.fetched > 0 {
                    debug!(
                        fetched = stats.fetched,
                        emitted = stats.emitted,
                        duplicates = stats.duplicates,
                        filtered = stats.filtered,
                        unmatched = stats.unmatched,
                        "mail_poll_cycle_complete"
                    );
                }
            }
            Err(WatcherError::PollExhausted { last, .. }) => {
                self.consecutive_failures += 1;
                warn!(
                    consecutive_failures = self.consecutive_failures,
                    error = %last,
                    "mail_poll_cycle_failed"
                );
                if self.consecutive_failures >= self.settings.unhealthy_after {
                    self.health.send_replace(WatcherHealth::Unhealthy {
                        consecutive_failures: self.consecutive_failures,
                        last_error: last.to_string(),
                    });
                }
            }
            Err(e) => {
                self.consecutive_failures += 1;
                error!(error = %e, "mail_watcher_fatal");
                self.health.send_replace(WatcherHealth::Fatal {
                    error: e.to_string(),
                });
            }
        }

        result
    }

    async fn poll_cycle(&mut self) -> Result<CycleStats, WatcherError> {
        let messages = self.fetch().await?;
        let mut stats = CycleStats {
            fetched: messages.len(),
            ..Default::default()
        };

        for message in messages {
            self.process(message, &mut stats).await;
        }

        Ok(stats)
    }

    async fn fetch(&mut self) -> Result<Vec<RawMessage>, WatcherError> {
        let attempts = self.settings.poll_attempts.max(1);
        let mut last = MailboxError::Transient("no poll attempted".to_string());

        for attempt in 1..=attempts {
            if !self.connected {
                self.reconnect().await?;
            }

            match self.mailbox.poll().await {
                Ok(messages) => return Ok(messages),
                Err(MailboxError::Auth(reason)) => {
                    self.connected = false;
                    return Err(WatcherError::AuthRejected(reason));
                }
                Err(e) => {
                    if matches!(e, MailboxError::Disconnected(_)) {
                        self.connected = false;
                    }
                    warn!(attempt = attempt, error = %e, "mail_poll_attempt_failed");
                    last = e;
                    if attempt < attempts {
                        sleep(backoff::exponential(self.settings.backoff_base, attempt)).await;
                    }
                }
            }
        }

        Err(WatcherError::PollExhausted { attempts, last })
    }

    async fn reconnect(&mut self) -> Result<(), WatcherError> {
        let attempts = self.settings.reconnect_attempts.max(1);
        let mut last = MailboxError::Disconnected("never connected".to_string());

        for attempt in 1..=attempts {
            match self.mailbox.connect(&self.credentials).await {
                Ok(()) => {
                    self.connected = true;
                    info!(attempt = attempt, "mailbox_connected");
                    return Ok(());
                }
                Err(MailboxError::Auth(reason)) => {
                    return Err(WatcherError::AuthRejected(reason));
                }
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "mailbox_connect_failed");
                    last = e;
                    if attempt < attempts {
                        sleep(backoff::exponential(self.settings.backoff_base, attempt)).await;
                    }
                }
            }
        }

        Err(WatcherError::ReconnectExhausted { attempts, last })
    }

    async fn process(&mut self, message: RawMessage, stats: &mut CycleStats) {
        let message_id = message.id.clone();

        if !self.seen.insert(&message_id) {
            debug!(message_id = %message_id, "mail_duplicate_dropped");
            stats.duplicates += 1;
            self.acknowledge(&message_id).await;
            return;
        }

        // The raw body is consumed here and never retained past extraction.
        match self.examine(message) {
            Examined::Event(event) => {
                info!(
                    message_id = %event.message_id,
                    recipient = %event.recipient,
                    payload_length = event.payload.len(),
                    "mail_event_emitted"
                );
                stats.emitted += 1;
                if self.events.send(event).await.is_err() {
                    warn!(message_id = %message_id, "mail_event_receiver_closed");
                }
            }
            Examined::Filtered => {
                debug!(message_id = %message_id, "mail_filtered");
                stats.filtered += 1;
            }
            Examined::NoPayload => {
                warn!(message_id = %message_id, reason = "no_payload", "mail_unmatched");
                stats.unmatched += 1;
            }
            Examined::Unparseable(e) => {
                warn!(message_id = %message_id, error = %e, reason = "unparseable", "mail_unmatched");
                stats.unmatched += 1;
            }
        }

        self.acknowledge(&message_id).await;
    }

    fn examine(&self, message: RawMessage) -> Examined {
        let email = match ParsedEmail::from_content(&message.content) {
            Ok(email) => email,
            Err(e) => return Examined::Unparseable(e.to_string()),
        };

        if !self.filter.accepts(&email) {
            return Examined::Filtered;
        }

        let Some(payload) = self.extractor.extract(&email) else {
            return Examined::NoPayload;
        };

        let recipient = message
            .envelope_to
            .filter(|to| !to.is_empty())
            .unwrap_or(email.to);

        Examined::Event(MailEvent {
            message_id: message.id,
            sender: email.from,
            recipient,
            subject: email.subject,
            received_at: message.received_at,
            payload,
        })
    }

    async fn acknowledge(&mut self, message_id: &str) {
        if let Err(e) = self.mailbox.acknowledge(message_id).await {
            // Redelivery is caught by the seen set.
            warn!(message_id = %message_id, error = %e, "mail_acknowledge_failed");
            if matches!(e, MailboxError::Disconnected(_)) {
                self.connected = false;
            }
        }
    }
}
