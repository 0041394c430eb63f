//! Per-author anti-spam throttle.
//!
//! A bounded map of author → last forward time. Eviction follows
//! insertion/update order: every accepted forward moves the author to the
//! back, and the front is evicted once the map is over capacity.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::pipeline::types::AuthorId;

#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    capacity: usize,
    last_sent: HashMap<AuthorId, (Instant, u64)>,
    order: BTreeMap<u64, AuthorId>,
    next_seq: u64,
}

impl RateLimiter {
    pub fn new(delay: Duration, capacity: usize) -> Self {
        Self {
            delay,
            capacity: capacity.max(1),
            last_sent: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.delay.is_zero()
    }

    /// May `author` forward now? Accepting updates the author's timestamp.
    pub fn allow(&mut self, author: AuthorId) -> bool {
        self.allow_at(author, Instant::now())
    }

    pub fn allow_at(&mut self, author: AuthorId, now: Instant) -> bool {
        if !self.would_allow_at(author, now) {
            return false;
        }
        self.record_at(author, now);
        true
    }

    /// Same verdict as [`allow`](Self::allow), without touching any state.
    pub fn would_allow(&self, author: AuthorId) -> bool {
        self.would_allow_at(author, Instant::now())
    }

    pub fn would_allow_at(&self, author: AuthorId, now: Instant) -> bool {
        if !self.is_enabled() {
            return true;
        }
        self.last_sent
            .get(&author)
            .is_none_or(|(last, _)| now.saturating_duration_since(*last) >= self.delay)
    }

    /// Stamp `author` as having forwarded now.
    pub fn record(&mut self, author: AuthorId) {
        self.record_at(author, Instant::now());
    }

    pub fn record_at(&mut self, author: AuthorId, now: Instant) {
        if !self.is_enabled() {
            return;
        }

        if let Some((_, seq)) = self.last_sent.get(&author).copied() {
            self.order.remove(&seq);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.last_sent.insert(author, (now, seq));
        self.order.insert(seq, author);

        while self.last_sent.len() > self.capacity {
            let Some((_, evicted)) = self.order.pop_first() else {
                break;
            };
            self.last_sent.remove(&evicted);
        }
    }

    pub fn len(&self) -> usize {
        self.last_sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_sent.is_empty()
    }

    pub fn contains(&self, author: AuthorId) -> bool {
        self.last_sent.contains_key(&author)
    }
}
