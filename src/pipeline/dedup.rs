//! Time-windowed deduplication of event keys.
//!
//! Entries live in insertion order (which is time order), so expiry is a
//! prefix purge from the front. A count index gives O(1) membership.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::pipeline::types::EventKey;

/// Bounded set of recently processed event keys.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    capacity: usize,
    entries: VecDeque<(EventKey, Instant)>,
    index: HashMap<EventKey, usize>,
}

impl Deduplicator {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            index: HashMap::new(),
        }
    }

    /// Whether `key` was recorded less than one window ago.
    pub fn seen(&mut self, key: &EventKey) -> bool {
        self.seen_at(key, Instant::now())
    }

    pub fn record(&mut self, key: EventKey) {
        self.record_at(key, Instant::now());
    }

    /// Record `key` unless it is a duplicate. Returns `true` for a duplicate.
    pub fn check_and_record(&mut self, key: &EventKey) -> bool {
        self.check_and_record_at(key, Instant::now())
    }

    pub fn seen_at(&mut self, key: &EventKey, now: Instant) -> bool {
        self.purge(now);
        self.index.contains_key(key)
    }

    pub fn record_at(&mut self, key: EventKey, now: Instant) {
        self.purge(now);
        *self.index.entry(key.clone()).or_insert(0) += 1;
        self.entries.push_back((key, now));
        while self.entries.len() > self.capacity {
            self.pop_front();
        }
    }

    pub fn check_and_record_at(&mut self, key: &EventKey, now: Instant) -> bool {
        if self.seen_at(key, now) {
            return true;
        }
        self.record_at(key.clone(), now);
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge(&mut self, now: Instant) {
        while let Some((_, observed_at)) = self.entries.front() {
            if now.saturating_duration_since(*observed_at) < self.window {
                break;
            }
            self.pop_front();
        }
    }

    fn pop_front(&mut self) {
        let Some((key, _)) = self.entries.pop_front() else {
            return;
        };
        if let Some(count) = self.index.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.index.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64) -> EventKey {
        EventKey::Message {
            source_id: 1,
            message_id: id,
        }
    }

    #[test]
    fn seen_within_window() {
        let mut dedup = Deduplicator::new(Duration::from_secs(10), 200);
        let t0 = Instant::now();
        dedup.record_at(key(1), t0);
        assert!(dedup.seen_at(&key(1), t0 + Duration::from_millis(9_999)));
        assert!(!dedup.seen_at(&key(2), t0));
    }

    #[test]
    fn expires_at_exactly_window() {
        let mut dedup = Deduplicator::new(Duration::from_secs(10), 200);
        let t0 = Instant::now();
        dedup.record_at(key(1), t0);
        assert!(!dedup.seen_at(&key(1), t0 + Duration::from_secs(10)));
        assert!(dedup.is_empty());
    }

    #[test]
    fn purge_is_prefix_only() {
        let mut dedup = Deduplicator::new(Duration::from_secs(10), 200);
        let t0 = Instant::now();
        dedup.record_at(key(1), t0);
        dedup.record_at(key(2), t0 + Duration::from_secs(5));
        assert!(!dedup.seen_at(&key(1), t0 + Duration::from_secs(11)));
        assert!(dedup.seen_at(&key(2), t0 + Duration::from_secs(11)));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn check_and_record_flags_second_call() {
        let mut dedup = Deduplicator::new(Duration::from_secs(10), 200);
        let t0 = Instant::now();
        assert!(!dedup.check_and_record_at(&key(1), t0));
        assert!(dedup.check_and_record_at(&key(1), t0 + Duration::from_secs(1)));
    }

    #[test]
    fn rerecorded_key_survives_expiry_of_older_entry() {
        let mut dedup = Deduplicator::new(Duration::from_secs(10), 200);
        let t0 = Instant::now();
        dedup.record_at(key(1), t0);
        dedup.record_at(key(1), t0 + Duration::from_secs(8));
        assert!(dedup.seen_at(&key(1), t0 + Duration::from_secs(12)));
    }

    #[test]
    fn capacity_bounds_memory() {
        let mut dedup = Deduplicator::new(Duration::from_secs(60), 3);
        let t0 = Instant::now();
        for id in 1..=4 {
            dedup.record_at(key(id), t0);
        }
        assert_eq!(dedup.len(), 3);
        assert!(!dedup.seen_at(&key(1), t0));
        assert!(dedup.seen_at(&key(4), t0));
    }
}
