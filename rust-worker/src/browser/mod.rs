//! Browser automation boundary.
//!
//! The orchestrator only sees the [`Browser`] trait: create a session,
//! close it, run one [`Action`] in it. [`webdriver`] implements it over the
//! W3C WebDriver protocol; [`pool`] bounds how many sessions exist at once.
//! [`state`] keeps cookies between jobs that share a session key.

pub mod pool;
pub mod state;
pub mod webdriver;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::Action;

pub use pool::{BrowserSessionPool, PoolError, PoolSettings, PoolStats, SessionLease};
pub use state::SessionStateStore;
pub use webdriver::{WebDriverBrowser, WebDriverSettings};

/// Opaque handle to a live browser execution context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cookie in the shape the DevTools `Network` domain uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    /// Unix seconds. Session cookies report `-1` or nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
}

/// Output of a successful action. Only `extract` produces a value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionResult {
    pub value: Option<String>,
}

impl ActionResult {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn value(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
        }
    }
}

/// How a failed action should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry-eligible; the session is still usable.
    Transient,
    /// The session is broken; discard it and retry on a fresh one.
    SessionFatal,
    /// Not retryable; the job fails.
    Fatal,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?} action error: {message}")]
pub struct ActionError {
    pub kind: FailureKind,
    pub message: String,
}

impl ActionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn session_fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::SessionFatal,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Browser: Send + Sync + 'static {
    async fn new_session(&self) -> Result<SessionHandle, ActionError>;

    async fn close_session(&self, handle: &SessionHandle) -> Result<(), ActionError>;

    async fn run_action(
        &self,
        handle: &SessionHandle,
        action: &Action,
    ) -> Result<ActionResult, ActionError>;

    /// Cookies held by the session. Drivers without cookie access report none.
    async fn export_cookies(&self, _handle: &SessionHandle) -> Result<Vec<Cookie>, ActionError> {
        Ok(Vec::new())
    }

    async fn import_cookies(
        &self,
        _handle: &SessionHandle,
        _cookies: &[Cookie],
    ) -> Result<(), ActionError> {
        Ok(())
    }
}
