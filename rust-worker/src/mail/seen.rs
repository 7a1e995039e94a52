//! Time-windowed set of recently seen message ids.
//!
//! Mailboxes redeliver across reconnects; ids seen within the window are
//! dropped as duplicates.

use std::time::Duration;

use moka::sync::Cache;

/// Upper bound on remembered ids, whatever the window.
const MAX_TRACKED_IDS: u64 = 100_000;

#[derive(Debug, Clone)]
pub struct SeenSet {
    ids: Cache<String, ()>,
}

impl SeenSet {
    pub fn new(window: Duration) -> Self {
        let ids = Cache::builder()
            .max_capacity(MAX_TRACKED_IDS)
            .time_to_live(window)
            .build();
        Self { ids }
    }

    /// Record `id`; returns `false` if it was already seen inside the window.
    pub fn insert(&self, id: &str) -> bool {
        self.ids.entry(id.to_string()).or_insert(()).is_fresh()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    pub fn len(&self) -> u64 {
        self.ids.run_pending_tasks();
        self.ids.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_within_window() {
        let seen = SeenSet::new(Duration::from_secs(60));
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_entries_expire() {
        let seen = SeenSet::new(Duration::from_millis(50));
        assert!(seen.insert("a"));
        std::thread::sleep(Duration::from_millis(120));
        assert!(!seen.contains("a"));
        assert!(seen.insert("a"));
        assert_eq!(seen.len(), 1);
    }
}
