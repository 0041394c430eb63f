//! Per-item outcomes, broadcast to subscribers and tallied in counters.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use crate::pipeline::deferral::Readiness;
use crate::pipeline::rules::FilterRejection;
use crate::pipeline::types::{ChatId, EventKey, MessageId};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// What the dispatch worker did with one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Sent { delivered_id: MessageId },
    Duplicate,
    NoRule,
    Filtered(FilterRejection),
    RateLimited,
    Deferred(Readiness),
    SendFailed(String),
    /// Filters passed but the composed payload was empty.
    NothingToSend,
    Panicked,
}

impl ItemOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::Duplicate => "duplicate",
            Self::NoRule => "no_rule",
            Self::Filtered(_) => "filtered",
            Self::RateLimited => "rate_limited",
            Self::Deferred(_) => "deferred",
            Self::SendFailed(_) => "send_failed",
            Self::NothingToSend => "nothing_to_send",
            Self::Panicked => "panicked",
        }
    }
}

/// One outcome, tagged with the item it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeEvent {
    pub source_id: ChatId,
    pub key: EventKey,
    pub retry: bool,
    pub outcome: ItemOutcome,
}

/// Running totals since the pipeline started.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub sent: AtomicU64,
    pub duplicates: AtomicU64,
    pub no_rule: AtomicU64,
    pub filtered: AtomicU64,
    pub rate_limited: AtomicU64,
    pub deferred: AtomicU64,
    pub send_failures: AtomicU64,
    pub empty: AtomicU64,
    pub panics: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub duplicates: u64,
    pub no_rule: u64,
    pub filtered: u64,
    pub rate_limited: u64,
    pub deferred: u64,
    pub send_failures: u64,
    pub empty: u64,
    pub panics: u64,
}

impl PipelineStats {
    pub fn tally(&self, outcome: &ItemOutcome) {
        let counter = match outcome {
            ItemOutcome::Sent { .. } => &self.sent,
            ItemOutcome::Duplicate => &self.duplicates,
            ItemOutcome::NoRule => &self.no_rule,
            ItemOutcome::Filtered(_) => &self.filtered,
            ItemOutcome::RateLimited => &self.rate_limited,
            ItemOutcome::Deferred(_) => &self.deferred,
            ItemOutcome::SendFailed(_) => &self.send_failures,
            ItemOutcome::NothingToSend => &self.empty,
            ItemOutcome::Panicked => &self.panics,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            no_rule: self.no_rule.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

/// Fan-out of outcomes plus the running tally.
#[derive(Debug)]
pub struct OutcomeSink {
    tx: broadcast::Sender<OutcomeEvent>,
    stats: PipelineStats,
}

impl Default for OutcomeSink {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            tx,
            stats: PipelineStats::default(),
        }
    }
}

impl OutcomeSink {
    pub fn subscribe(&self) -> broadcast::Receiver<OutcomeEvent> {
        self.tx.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn publish(&self, event: OutcomeEvent) {
        self.stats.tally(&event.outcome);
        // Ok if nobody is listening
        let _ = self.tx.send(event);
    }
}
