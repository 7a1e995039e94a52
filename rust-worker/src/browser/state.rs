//! Browser state carried between jobs.
//!
//! A job that names a session key has its cookies saved after a successful
//! run; the next job with the same key starts from them instead of logging in
//! again. Saved state expires after the configured lifetime, and state about
//! to expire is not handed out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use tokio::time::Instant;

use super::Cookie;

/// State this close to expiry is treated as already gone.
pub const REUSE_MARGIN: Duration = Duration::from_secs(300);

const MAX_SAVED_STATES: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct SavedState {
    pub cookies: Vec<Cookie>,
    pub saved_at: DateTime<Utc>,
    expires_at: Instant,
}

impl SavedState {
    /// Whether enough lifetime is left to start a job from it.
    pub fn is_reusable(&self) -> bool {
        self.expires_at.saturating_duration_since(Instant::now()) > REUSE_MARGIN
    }
}

/// Saved cookies per session key. A zero lifetime disables saving.
#[derive(Clone)]
pub struct SessionStateStore {
    ttl: Duration,
    states: Option<Cache<String, Arc<SavedState>>>,
}

impl SessionStateStore {
    pub fn new(ttl: Duration) -> Self {
        let states = (!ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(MAX_SAVED_STATES)
                .time_to_live(ttl)
                .build()
        });
        Self { ttl, states }
    }

    pub fn is_enabled(&self) -> bool {
        self.states.is_some()
    }

    /// Replace the state for `key`. Returns `false` when nothing was stored.
    pub fn save(&self, key: &str, cookies: Vec<Cookie>) -> bool {
        let Some(states) = &self.states else {
            return false;
        };
        if cookies.is_empty() {
            return false;
        }
        let state = SavedState {
            cookies,
            saved_at: Utc::now(),
            expires_at: Instant::now() + self.ttl,
        };
        states.insert(key.to_string(), Arc::new(state));
        true
    }

    /// Saved state for `key`, if it still has a useful lifetime left.
    pub fn load(&self, key: &str) -> Option<Arc<SavedState>> {
        let states = self.states.as_ref()?;
        let state = states.get(key)?;
        if state.is_reusable() {
            return Some(state);
        }
        states.invalidate(key);
        None
    }

    pub fn forget(&self, key: &str) {
        if let Some(states) = &self.states {
            states.invalidate(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str) -> Cookie {
        Cookie {
            name: name.to_string(),
            value: "v".to_string(),
            domain: Some("example.com".to_string()),
            path: Some("/".to_string()),
            secure: true,
            http_only: true,
            expires: None,
        }
    }

    #[test]
    fn test_save_and_load() {
        let store = SessionStateStore::new(Duration::from_secs(3600));
        assert!(store.is_enabled());
        assert!(store.load("user-1").is_none());

        assert!(store.save("user-1", vec![cookie("sid")]));
        let state = store.load("user-1").unwrap();
        assert_eq!(state.cookies, vec![cookie("sid")]);
        assert!(store.load("user-2").is_none());

        assert!(store.save("user-1", vec![cookie("sid"), cookie("pref")]));
        assert_eq!(store.load("user-1").unwrap().cookies.len(), 2);

        store.forget("user-1");
        assert!(store.load("user-1").is_none());
    }

    #[test]
    fn test_empty_cookie_jar_not_saved() {
        let store = SessionStateStore::new(Duration::from_secs(3600));
        assert!(!store.save("user-1", Vec::new()));
        assert!(store.load("user-1").is_none());
    }

    #[test]
    fn test_state_near_expiry_not_reused() {
        let store = SessionStateStore::new(Duration::from_secs(240));
        assert!(store.save("user-1", vec![cookie("sid")]));
        assert!(store.load("user-1").is_none());
    }

    #[test]
    fn test_zero_lifetime_disables() {
        let store = SessionStateStore::new(Duration::ZERO);
        assert!(!store.is_enabled());
        assert!(!store.save("user-1", vec![cookie("sid")]));
        assert!(store.load("user-1").is_none());
    }
}
