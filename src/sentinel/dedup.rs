//! Notification Deduplication
//!
//! Every sentinel publishes the same failover events, so a client subscribed
//! to several of them sees each logical event once per sentinel. Events are
//! keyed by channel + raw payload and dropped if the same key was accepted
//! within the window.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;

/// Default suppression window (4 seconds)
pub const DEDUP_WINDOW_MS: u64 = 4000;

/// Default interval between prune sweeps (2 seconds)
pub const DEDUP_SWEEP_PERIOD_MS: u64 = 2000;

/// Time-windowed set of recently processed events
#[derive(Debug)]
pub struct EventDeduplicator {
    window_ms: u64,
    seen: DashMap<String, u64>,
}

impl EventDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            seen: DashMap::new(),
        }
    }

    /// Dedup key for a published message
    pub fn key(channel: &str, payload: &str) -> String {
        let mut key = String::with_capacity(channel.len() + payload.len());
        key.push_str(channel);
        key.push_str(payload);
        key
    }

    /// True if the event should be processed.
    ///
    /// A duplicate inside the window is rejected without extending the
    /// window; otherwise `now_ms` is recorded.
    pub fn should_process(&self, key: &str, now_ms: u64) -> bool {
        match self.seen.entry(key.to_string()) {
            Entry::Occupied(mut seen) => {
                if now_ms.saturating_sub(*seen.get()) < self.window_ms {
                    false
                } else {
                    seen.insert(now_ms);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now_ms);
                true
            }
        }
    }

    /// Drop entries older than the window; returns how many were removed
    pub fn prune(&self, now_ms: u64) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, seen| now_ms.saturating_sub(*seen) < self.window_ms);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEDUP_WINDOW_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_window_is_dropped() {
        let dedup = EventDeduplicator::default();
        let key = EventDeduplicator::key("+switch-master", "mymaster 10.0.0.1 6379 10.0.0.2 6379");

        assert!(dedup.should_process(&key, 10_000));
        assert!(!dedup.should_process(&key, 13_999));
    }

    #[test]
    fn test_duplicate_after_window_is_processed() {
        let dedup = EventDeduplicator::default();
        let key = EventDeduplicator::key("+odown", "master mymaster 10.0.0.1 6379 #quorum 2");

        assert!(dedup.should_process(&key, 10_000));
        assert!(dedup.should_process(&key, 14_001));
    }

    #[test]
    fn test_rejection_does_not_extend_window() {
        let dedup = EventDeduplicator::default();
        let key = EventDeduplicator::key("+sentinel", "sentinel x 10.0.0.4 26379 @ mymaster");

        assert!(dedup.should_process(&key, 0));
        assert!(!dedup.should_process(&key, 3_000));
        // Measured from the accepted event at 0, not the rejected one at 3000
        assert!(dedup.should_process(&key, 4_000));
    }

    #[test]
    fn test_distinct_payloads_are_independent() {
        let dedup = EventDeduplicator::default();
        assert!(dedup.should_process(&EventDeduplicator::key("+odown", "a"), 0));
        assert!(dedup.should_process(&EventDeduplicator::key("+odown", "b"), 0));
        assert!(dedup.should_process(&EventDeduplicator::key("-odown", "a"), 0));
    }

    #[test]
    fn test_prune_removes_expired_entries() {
        let dedup = EventDeduplicator::default();
        dedup.should_process("old", 0);
        dedup.should_process("fresh", 3_000);

        assert_eq!(dedup.prune(4_500), 1);
        assert_eq!(dedup.len(), 1);
        assert!(!dedup.should_process("fresh", 4_500));
    }
}
