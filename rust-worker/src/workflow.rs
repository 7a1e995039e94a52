//! Workflow descriptors: the ordered browser actions a job runs once its
//! mail trigger arrives.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholder replaced with the mail payload in `navigate` URLs and `fill` values.
pub const PAYLOAD_PLACEHOLDER: &str = "{{payload}}";

/// Parse a navigation target; only http and https are followed.
pub fn check_url(url: &str) -> Result<url::Url, String> {
    let parsed = url::Url::parse(url).map_err(|e| e.to_string())?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(format!("unsupported scheme {other}")),
    }
}

/// A URL that is nothing but the placeholder navigates to the payload itself,
/// e.g. a confirmation link pulled out of the mail.
fn is_payload_url(url: &str) -> bool {
    url.trim() == PAYLOAD_PLACEHOLDER
}

/// Percent-encode the payload so it stays inside the path segment or query
/// value it is pasted into.
fn encode_payload(payload: &str) -> String {
    url::form_urlencoded::byte_serialize(payload.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// A single browser action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Fill {
        selector: String,
        value: String,
    },
    WaitFor {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Extract {
        name: String,
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attribute: Option<String>,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Click { .. } => "click",
            Action::Fill { .. } => "fill",
            Action::WaitFor { .. } => "wait_for",
            Action::Extract { .. } => "extract",
        }
    }

    /// Substitute the mail payload into the action's templated fields.
    ///
    /// Inside a URL the payload is percent-encoded, unless the URL is the
    /// bare placeholder. The result of that case still has to pass
    /// [`check_url`] before it is navigated to.
    pub fn render(&self, payload: &str) -> Action {
        match self {
            Action::Navigate { url } if is_payload_url(url) => Action::Navigate {
                url: payload.trim().to_string(),
            },
            Action::Navigate { url } => Action::Navigate {
                url: url.replace(PAYLOAD_PLACEHOLDER, &encode_payload(payload)),
            },
            Action::Fill { selector, value } => Action::Fill {
                selector: selector.clone(),
                value: value.replace(PAYLOAD_PLACEHOLDER, payload),
            },
            other => other.clone(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("workflow has no actions")]
    Empty,

    #[error("step {step}: invalid url {url:?}: {message}")]
    InvalidUrl {
        step: usize,
        url: String,
        message: String,
    },

    #[error("step {step}: empty selector")]
    EmptySelector { step: usize },

    #[error("step {step}: duplicate extract name {name:?}")]
    DuplicateExtract { step: usize, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub actions: Vec<Action>,
}

impl Workflow {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Check the workflow before it is accepted.
    ///
    /// URLs are validated with the placeholder substituted by a neutral
    /// token, so `https://x/confirm?code={{payload}}` is accepted. A bare
    /// `{{payload}}` URL can only be checked once rendered.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.actions.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let mut names = HashSet::new();
        for (step, action) in self.actions.iter().enumerate() {
            match action {
                Action::Navigate { url } if is_payload_url(url) => {}
                Action::Navigate { url } => {
                    let templated = url.replace(PAYLOAD_PLACEHOLDER, "payload");
                    check_url(&templated).map_err(|message| WorkflowError::InvalidUrl {
                        step,
                        url: url.clone(),
                        message,
                    })?;
                }
                Action::Click { selector }
                | Action::Fill { selector, .. }
                | Action::WaitFor { selector, .. } => {
                    if selector.trim().is_empty() {
                        return Err(WorkflowError::EmptySelector { step });
                    }
                }
                Action::Extract { name, selector, .. } => {
                    if selector.trim().is_empty() {
                        return Err(WorkflowError::EmptySelector { step });
                    }
                    if !names.insert(name.as_str()) {
                        return Err(WorkflowError::DuplicateExtract {
                            step,
                            name: name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
