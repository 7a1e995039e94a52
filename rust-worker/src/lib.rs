//! Mailflow - mail-triggered headless browser jobs.
//!
//! A caller submits a job (a browser workflow plus a correlation key). The
//! job waits for a matching inbound mail, pulls a payload such as a one-time
//! code or confirmation link out of it, and then drives a pooled browser
//! session through the workflow with that payload.
//!
//! ## Architecture
//!
//! ```text
//! Webhooks → WebhookInbox → MailWatcher → dispatcher → CorrelationIndex
//!                                                            │
//! API → Orchestrator ── register ──────────────────────────────┘
//!            │  (job task per job)
//!            ├── BrowserSessionPool → Browser (WebDriver)
//!            └── ResultStore ← API reads
//! ```

pub mod browser;
pub mod config;
pub mod correlation;
pub mod job;
pub mod mail;
pub mod orchestrator;
pub mod store;
pub mod util;
pub mod web;
pub mod workflow;

// Re-export commonly used types
pub use browser::{Browser, BrowserSessionPool, WebDriverBrowser};
pub use config::Config;
pub use correlation::{CorrelationIndex, MatchRule};
pub use job::{JobId, JobSnapshot, JobStatus};
pub use mail::{MailEvent, MailWatcher, Mailbox, WebhookInbox};
pub use orchestrator::{JobRequest, Orchestrator, OrchestratorSettings};
pub use store::ResultStore;
pub use web::AppState;
pub use workflow::{Action, Workflow};
