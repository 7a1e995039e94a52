//! Configuration module for environment variable parsing.
//!
//! Every option has a default; unparseable values are logged and replaced by
//! the default rather than aborting startup. [`Config::validate`] then
//! rejects combinations the service cannot run with.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::warn;

use crate::browser::state::REUSE_MARGIN;
use crate::browser::{PoolSettings, WebDriverSettings};
use crate::correlation::{CorrelationField, MatchMode, MatchRule};
use crate::mail::{FilterRules, PayloadExtractor, WatcherSettings};
use crate::orchestrator::{OrchestratorSettings, RetryScope};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // API
    // =========================================================================
    /// Port for the API server to listen on
    pub port: u16,

    /// Bearer token required on `/jobs` routes when set
    pub api_token: Option<String>,

    // =========================================================================
    // Mail watcher
    // =========================================================================
    pub mail_poll_interval_ms: u64,

    /// Poll attempts within one cycle
    pub mail_poll_attempts: u32,

    /// Reconnect attempts before the watcher reports fatal
    pub mail_reconnect_attempts: u32,

    pub mail_backoff_base_ms: u64,

    /// Consecutive failed cycles before the watcher reports unhealthy
    pub mail_unhealthy_after: u32,

    /// Window for suppressing redelivered message ids
    pub mail_seen_window_secs: u64,

    /// Messages buffered by the webhook inbox before deliveries are refused
    pub mail_inbox_capacity: usize,

    pub sender_filter: Option<Vec<String>>,

    pub subject_filter: Option<Vec<String>>,

    /// Payload regexes; `None` means the built-in OTP patterns
    pub payload_patterns: Option<Vec<String>>,

    /// CSS selector for structural extraction from the HTML body
    pub payload_selector: Option<String>,

    pub payload_attribute: String,

    // =========================================================================
    // Webhook verification
    // =========================================================================
    pub cloudflare_auth_token: Option<String>,

    /// Mailgun signing key for HMAC signature verification
    pub mailgun_signing_key: Option<String>,

    /// Mailgun domain for recipient validation
    pub mailgun_domain: Option<String>,

    /// Maximum age in seconds for Mailgun webhook timestamps
    pub mailgun_signature_max_age: u64,

    // =========================================================================
    // Correlation
    // =========================================================================
    pub correlation_field: CorrelationField,

    pub correlation_match: MatchMode,

    // =========================================================================
    // Jobs
    // =========================================================================
    pub await_mail_timeout_secs: u64,

    pub step_timeout_ms: u64,

    pub max_attempts: u32,

    pub retry_scope: RetryScope,

    pub retry_backoff_ms: u64,

    /// Delay range in milliseconds before each browser action (min, max)
    pub step_delay_ms: (u64, u64),

    // =========================================================================
    // Browser pool
    // =========================================================================
    pub pool_max_sessions: usize,

    pub pool_acquire_timeout_secs: u64,

    pub session_idle_timeout_secs: u64,

    pub session_max_lifetime_secs: u64,

    pub session_create_attempts: u32,

    /// Lifetime of cookies saved under a job's session key; 0 disables
    pub session_state_ttl_secs: u64,

    /// Tick for the session reaper and the result sweeper
    pub reaper_interval_secs: u64,

    pub webdriver_url: String,

    pub browser_headless: bool,

    /// Optional pool of user agents to rotate through
    pub user_agent_pool: Option<Vec<String>>,

    // =========================================================================
    // Results
    // =========================================================================
    pub result_retention_secs: u64,

    /// JSON file the result store is loaded from and persisted to
    pub result_store_path: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            port: parse_var("PORT", 8080),
            api_token: non_empty("API_TOKEN"),

            mail_poll_interval_ms: parse_var("MAIL_POLL_INTERVAL_MS", 2000),
            mail_poll_attempts: parse_var("MAIL_POLL_ATTEMPTS", 3),
            mail_reconnect_attempts: parse_var("MAIL_RECONNECT_ATTEMPTS", 5),
            mail_backoff_base_ms: parse_var("MAIL_BACKOFF_BASE_MS", 500),
            mail_unhealthy_after: parse_var("MAIL_UNHEALTHY_AFTER", 3),
            mail_seen_window_secs: parse_var("MAIL_SEEN_WINDOW_SECS", 3600),
            mail_inbox_capacity: parse_var("MAIL_INBOX_CAPACITY", 1000),
            sender_filter: parse_csv("MAIL_SENDER_FILTER"),
            subject_filter: parse_csv("MAIL_SUBJECT_FILTER"),
            payload_patterns: parse_list("MAIL_PAYLOAD_PATTERNS", ";;"),
            payload_selector: non_empty("MAIL_PAYLOAD_SELECTOR"),
            payload_attribute: non_empty("MAIL_PAYLOAD_ATTRIBUTE")
                .unwrap_or_else(|| "href".to_string()),

            cloudflare_auth_token: non_empty("CLOUDFLARE_AUTH_TOKEN"),
            mailgun_signing_key: non_empty("MAILGUN_SIGNING_KEY"),
            mailgun_domain: non_empty("MAILGUN_DOMAIN"),
            mailgun_signature_max_age: parse_var("MAILGUN_SIGNATURE_MAX_AGE", 300), // 5 minutes default

            correlation_field: parse_choice(
                "CORRELATION_FIELD",
                CorrelationField::Any,
                &[
                    ("recipient", CorrelationField::Recipient),
                    ("subject", CorrelationField::Subject),
                    ("any", CorrelationField::Any),
                ],
            ),
            correlation_match: parse_choice(
                "CORRELATION_MATCH",
                MatchMode::Exact,
                &[("exact", MatchMode::Exact), ("prefix", MatchMode::Prefix)],
            ),

            await_mail_timeout_secs: parse_var("AWAIT_MAIL_TIMEOUT_SECS", 300),
            step_timeout_ms: parse_var("STEP_TIMEOUT_MS", 30_000),
            max_attempts: parse_var("MAX_ATTEMPTS", 3),
            retry_scope: parse_choice(
                "RETRY_SCOPE",
                RetryScope::Step,
                &[("step", RetryScope::Step), ("workflow", RetryScope::Workflow)],
            ),
            retry_backoff_ms: parse_var("RETRY_BACKOFF_MS", 1000),
            step_delay_ms: parse_range("STEP_DELAY_RANGE_MS", (0, 0)),

            pool_max_sessions: parse_var("POOL_MAX_SESSIONS", 2),
            pool_acquire_timeout_secs: parse_var("POOL_ACQUIRE_TIMEOUT_SECS", 60),
            session_idle_timeout_secs: parse_var("SESSION_IDLE_TIMEOUT_SECS", 300),
            session_max_lifetime_secs: parse_var("SESSION_MAX_LIFETIME_SECS", 1800),
            session_create_attempts: parse_var("SESSION_CREATE_ATTEMPTS", 3),
            session_state_ttl_secs: parse_var("SESSION_STATE_TTL_SECS", 86_400),
            reaper_interval_secs: parse_var("REAPER_INTERVAL_SECS", 30),
            webdriver_url: non_empty("WEBDRIVER_URL")
                .unwrap_or_else(|| "http://localhost:4444".to_string()),
            browser_headless: parse_bool("BROWSER_HEADLESS", true),
            user_agent_pool: parse_csv("USER_AGENT_POOL"),

            result_retention_secs: parse_var("RESULT_RETENTION_SECS", 3600),
            result_store_path: non_empty("RESULT_STORE_PATH"),
        }
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool_max_sessions == 0 {
            bail!("POOL_MAX_SESSIONS must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.mail_poll_attempts == 0 || self.mail_reconnect_attempts == 0 {
            bail!("MAIL_POLL_ATTEMPTS and MAIL_RECONNECT_ATTEMPTS must be at least 1");
        }
        if self.session_create_attempts == 0 {
            bail!("SESSION_CREATE_ATTEMPTS must be at least 1");
        }
        if self.mail_poll_interval_ms == 0 || self.reaper_interval_secs == 0 {
            bail!("MAIL_POLL_INTERVAL_MS and REAPER_INTERVAL_SECS must be non-zero");
        }
        let state_ttl = Duration::from_secs(self.session_state_ttl_secs);
        if !state_ttl.is_zero() && state_ttl <= REUSE_MARGIN {
            bail!(
                "SESSION_STATE_TTL_SECS must be 0 or more than {}",
                REUSE_MARGIN.as_secs()
            );
        }
        let no_patterns = matches!(&self.payload_patterns, Some(p) if p.is_empty());
        if no_patterns && self.payload_selector.is_none() {
            bail!("MAIL_PAYLOAD_PATTERNS is empty and no MAIL_PAYLOAD_SELECTOR is set");
        }
        self.extractor()?;
        Ok(())
    }

    pub fn extractor(&self) -> Result<PayloadExtractor> {
        match &self.payload_patterns {
            None if self.payload_selector.is_none() => Ok(PayloadExtractor::with_default_patterns()),
            patterns => PayloadExtractor::new(
                patterns.as_deref().unwrap_or_default(),
                self.payload_selector.as_deref(),
                Some(self.payload_attribute.as_str()),
            ),
        }
    }

    pub fn filter_rules(&self) -> FilterRules {
        FilterRules::new(self.sender_filter.clone(), self.subject_filter.clone())
    }

    pub fn match_rule(&self) -> MatchRule {
        MatchRule {
            field: self.correlation_field,
            mode: self.correlation_match,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.mail_poll_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn watcher_settings(&self) -> WatcherSettings {
        WatcherSettings {
            poll_attempts: self.mail_poll_attempts,
            reconnect_attempts: self.mail_reconnect_attempts,
            backoff_base: Duration::from_millis(self.mail_backoff_base_ms),
            unhealthy_after: self.mail_unhealthy_after,
            seen_window: Duration::from_secs(self.mail_seen_window_secs),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_sessions: self.pool_max_sessions,
            idle_timeout: Duration::from_secs(self.session_idle_timeout_secs),
            max_lifetime: Duration::from_secs(self.session_max_lifetime_secs),
            create_attempts: self.session_create_attempts,
            create_backoff: Duration::from_millis(self.mail_backoff_base_ms),
        }
    }

    pub fn webdriver_settings(&self) -> WebDriverSettings {
        WebDriverSettings {
            endpoint: self.webdriver_url.clone(),
            headless: self.browser_headless,
            user_agent_pool: self.user_agent_pool.clone(),
            ..WebDriverSettings::default()
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            await_mail_timeout: Duration::from_secs(self.await_mail_timeout_secs),
            pool_acquire_timeout: Duration::from_secs(self.pool_acquire_timeout_secs),
            step_timeout: Duration::from_millis(self.step_timeout_ms),
            max_attempts: self.max_attempts,
            retry_scope: self.retry_scope,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            step_delay_ms: self.step_delay_ms,
            session_state_ttl: Duration::from_secs(self.session_state_ttl_secs),
        }
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a scalar, falling back to `default` when unset or invalid.
fn parse_var<T: FromStr + Copy + std::fmt::Debug>(name: &str, default: T) -> T {
    let Some(raw) = non_empty(name) else {
        return default;
    };
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, default = ?default, "Invalid value, using default");
            default
        }
    }
}

fn parse_bool(name: &str, default: bool) -> bool {
    let Some(raw) = non_empty(name) else {
        return default;
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid boolean, using default");
            default
        }
    }
}

fn parse_choice<T: Copy>(name: &str, default: T, choices: &[(&str, T)]) -> T {
    let Some(raw) = non_empty(name) else {
        return default;
    };
    let wanted = raw.to_ascii_lowercase();
    match choices.iter().find(|(label, _)| *label == wanted) {
        Some((_, value)) => *value,
        None => {
            warn!(env_var = name, value = %raw, "Unknown option, using default");
            default
        }
    }
}

/// Parse a comma-separated range like "500,5000" into a tuple.
fn parse_range(name: &str, default: (u64, u64)) -> (u64, u64) {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 2 {
        warn!(env_var = name, value = %raw, "Invalid range format, using default");
        return default;
    }

    let min = parts[0].trim().parse::<u64>();
    let max = parts[1].trim().parse::<u64>();

    match (min, max) {
        (Ok(min), Ok(max)) if min <= max => (min, max),
        _ => {
            warn!(env_var = name, value = %raw, "Invalid range values, using default");
            default
        }
    }
}

/// Parse a comma-separated list of strings.
fn parse_csv(name: &str) -> Option<Vec<String>> {
    parse_list(name, ",")
}

fn parse_list(name: &str, separator: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|raw| {
        raw.split(separator)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
