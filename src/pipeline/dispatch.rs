//! Dispatch queue and the single worker that drains it.
//!
//! Every producer (triage intake, album timers, deferral timers, backlog
//! catch-up) pushes onto one unbounded FIFO. Exactly one worker consumes it,
//! so sends are totally ordered. Timers only ever enqueue.
//!
//! Per item the worker runs:
//! 1. Rule lookup (rules may have changed since triage)
//! 2. First-pass dedup (fresh items only)
//! 3. Filters
//! 4. Rate limiter (checked here, stamped at send)
//! 5. Readiness, deferring fresh items that are not ready
//! 6. Pre-send dedup against what was already delivered
//! 7. Compose and send, then advance the last-seen id

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ForwarderConfig;
use crate::error::PipelineError;
use crate::pipeline::dedup::Deduplicator;
use crate::pipeline::deferral::{DeferralManager, Readiness};
use crate::pipeline::forwarder::ForwarderDeps;
use crate::pipeline::outcome::{ItemOutcome, OutcomeEvent, OutcomeSink};
use crate::pipeline::rate_limit::RateLimiter;
use crate::pipeline::rules::FilterEngine;
use crate::pipeline::types::{DispatchUnit, InboundMessage};

/// One entry on the dispatch queue.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// First attempt, from triage, an album timer, or a backlog catch-up.
    Fresh(DispatchUnit),
    /// Re-submission after deferral. Skips first-pass dedup and the rate-limit check.
    Retry(DispatchUnit),
    /// Ends the worker loop.
    Stop,
}

impl WorkItem {
    fn label(&self) -> &'static str {
        match self {
            Self::Fresh(_) => "fresh",
            Self::Retry(_) => "retry",
            Self::Stop => "stop",
        }
    }
}

/// Producer handle for the dispatch queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
}

impl DispatchQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Never blocks. Fails only once the worker has gone away.
    pub fn push(&self, item: WorkItem) -> Result<(), PipelineError> {
        self.tx.send(item).map_err(|_| PipelineError::QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The single consumer of the dispatch queue.
pub struct DispatchWorker {
    rx: mpsc::UnboundedReceiver<WorkItem>,
    deps: ForwarderDeps,
    filters: Arc<FilterEngine>,
    deferral: DeferralManager,
    outcomes: Arc<OutcomeSink>,
    /// Keys seen on first pass.
    observed: Deduplicator,
    /// Keys handed to the sender.
    delivered: Deduplicator,
    limiter: RateLimiter,
    sequential_delay: Duration,
    /// Set on shutdown to drop queued items instead of processing them.
    abandon: Arc<AtomicBool>,
}

impl DispatchWorker {
    pub fn new(
        rx: mpsc::UnboundedReceiver<WorkItem>,
        config: &ForwarderConfig,
        deps: ForwarderDeps,
        filters: Arc<FilterEngine>,
        deferral: DeferralManager,
        outcomes: Arc<OutcomeSink>,
        abandon: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rx,
            deps,
            filters,
            deferral,
            outcomes,
            observed: Deduplicator::new(config.dedup_window, config.dedup_capacity),
            delivered: Deduplicator::new(config.dedup_window, config.dedup_capacity),
            limiter: RateLimiter::new(config.antispam_delay, config.rate_limiter_capacity),
            sequential_delay: config.sequential_delay,
            abandon,
        }
    }

    /// Drain the queue until `Stop` or until every producer is gone.
    /// Returns the number of items abandoned instead of processed.
    pub async fn run(mut self) -> usize {
        info!(
            sequential_delay_ms = self.sequential_delay.as_millis() as u64,
            "Dispatch worker started"
        );

        let mut abandoned = 0;
        while let Some(item) = self.rx.recv().await {
            if self.abandon.load(Ordering::SeqCst) && !matches!(item, WorkItem::Stop) {
                log_abandoned(&item);
                abandoned += 1;
                continue;
            }

            let (unit, retry) = match item {
                WorkItem::Fresh(unit) => (unit, false),
                WorkItem::Retry(unit) => (unit, true),
                WorkItem::Stop => {
                    abandoned += self.abandon_remaining();
                    info!(abandoned, "Dispatch worker stopped");
                    return abandoned;
                }
            };

            let source_id = unit.source_id();
            let key = unit.key();

            let outcome = match AssertUnwindSafe(self.process(unit, retry))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(source_id, key = %key, "Panic while processing item, continuing");
                    ItemOutcome::Panicked
                }
            };

            debug!(source_id, key = %key, retry, outcome = outcome.label(), "Item processed");
            self.outcomes.publish(OutcomeEvent {
                source_id,
                key,
                retry,
                outcome,
            });

            if !self.sequential_delay.is_zero() {
                tokio::time::sleep(self.sequential_delay).await;
            }
        }

        info!("Dispatch queue closed, worker exiting");
        abandoned
    }

    /// Items pushed after `Stop` (late timers, racing producers).
    fn abandon_remaining(&mut self) -> usize {
        let mut abandoned = 0;
        while let Ok(item) = self.rx.try_recv() {
            if log_abandoned(&item) {
                abandoned += 1;
            }
        }
        abandoned
    }

    async fn process(&mut self, unit: DispatchUnit, retry: bool) -> ItemOutcome {
        let source_id = unit.source_id();
        let key = unit.key();

        let Some(rule) = self
            .deps
            .rules
            .resolve_rule(source_id)
            .filter(|r| r.enabled)
        else {
            debug!(source_id, "No enabled rule, dropping item");
            return ItemOutcome::NoRule;
        };

        // A resumed unit already passed the limiter when it was deferred.
        let (unit, resumed) = if retry {
            (unit, true)
        } else if self.deferral.supersede(&key).await {
            info!(source_id, key = %key, "Fresh event superseded pending deferral");
            (unit, true)
        } else {
            match self.drop_observed(unit) {
                Some(unit) => (unit, false),
                None => {
                    debug!(source_id, key = %key, "Duplicate event dropped");
                    return ItemOutcome::Duplicate;
                }
            }
        };

        let first = Arc::clone(unit.first());
        let author = first
            .author_id
            .and_then(|id| self.deps.authors.author_info(id));

        let unit = match self.filters.apply(unit, &rule, author.as_ref()) {
            Ok(unit) => unit,
            Err(rejection) => {
                debug!(source_id, key = %key, reason = rejection.label(), "Filtered out");
                return ItemOutcome::Filtered(rejection);
            }
        };

        // Checked here, stamped only once the unit reaches the sender.
        if let Some(author_id) = first.author_id {
            if !resumed && !self.limiter.would_allow(author_id) {
                debug!(source_id, author_id, "Rate limited");
                return ItemOutcome::RateLimited;
            }
        }

        let readiness = Readiness::of(&unit);
        if readiness != Readiness::Ready {
            if !retry {
                self.deferral.defer(key.clone(), unit, readiness).await;
                return ItemOutcome::Deferred(readiness);
            }
            warn!(
                source_id,
                key = %key,
                reason = readiness.label(),
                "Still not ready after deferral, sending as-is"
            );
        }

        let Some(unit) = self.drop_delivered(unit) else {
            debug!(source_id, key = %key, "Already delivered, skipping send");
            return ItemOutcome::Duplicate;
        };

        let payload = self.deps.payloads.build(&unit, &rule);
        if payload.is_empty() {
            debug!(source_id, key = %key, "Composed payload is empty");
            return ItemOutcome::NothingToSend;
        }

        if let Some(author_id) = first.author_id {
            self.limiter.record(author_id);
        }

        let items = payload.items.len();
        match self.deps.sender.send(&rule, payload).await {
            Ok(delivery) => {
                info!(
                    source_id,
                    destination = rule.destination,
                    delivered_id = delivery.message_id,
                    items,
                    "Forwarded"
                );
                if self.deps.last_seen.advance(source_id, unit.newest_id()) {
                    if let Err(e) = self.deps.last_seen.persist().await {
                        warn!(error = %e, "Failed to persist last-seen ids");
                    }
                }
                ItemOutcome::Sent {
                    delivered_id: delivery.message_id,
                }
            }
            Err(e) => {
                error!(source_id, destination = rule.destination, error = %e, "Send failed");
                ItemOutcome::SendFailed(e.to_string())
            }
        }
    }

    /// First-pass dedup. Albums lose duplicate members; `None` if nothing is left.
    fn drop_observed(&mut self, unit: DispatchUnit) -> Option<DispatchUnit> {
        let observed = &mut self.observed;
        retain_members(unit, |m| !observed.check_and_record(&m.event_key()))
    }

    /// Pre-send dedup. Survivors are recorded as delivered.
    fn drop_delivered(&mut self, unit: DispatchUnit) -> Option<DispatchUnit> {
        let delivered = &mut self.delivered;
        retain_members(unit, |m| !delivered.check_and_record(&m.event_key()))
    }
}

fn log_abandoned(item: &WorkItem) -> bool {
    match item {
        WorkItem::Fresh(unit) | WorkItem::Retry(unit) => {
            warn!(
                source_id = unit.source_id(),
                key = %unit.key(),
                kind = item.label(),
                messages = unit.len(),
                "Abandoning queued item on shutdown"
            );
            true
        }
        WorkItem::Stop => false,
    }
}

fn retain_members<F>(unit: DispatchUnit, mut keep: F) -> Option<DispatchUnit>
where
    F: FnMut(&InboundMessage) -> bool,
{
    match unit {
        DispatchUnit::Single(message) => keep(&message).then_some(DispatchUnit::Single(message)),
        DispatchUnit::Album { group_id, messages } => {
            let kept = messages.into_iter().filter(|m| keep(m)).collect();
            DispatchUnit::album(group_id, kept)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_fails_once_receiver_is_gone() {
        let (queue, rx) = DispatchQueue::channel();
        assert!(queue.push(WorkItem::Stop).is_ok());
        drop(rx);
        assert!(matches!(
            queue.push(WorkItem::Stop),
            Err(PipelineError::QueueClosed)
        ));
        assert!(queue.is_closed());
    }

    #[test]
    fn retain_members_drops_album_members() {
        let members = (1..=3)
            .map(|id| Arc::new(InboundMessage::text(1, id, "")))
            .collect();
        let unit = DispatchUnit::album(7, members).unwrap();
        let kept = retain_members(unit, |m| m.id != 2).unwrap();
        let ids: Vec<_> = kept.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn retain_members_empty_album_is_none() {
        let members = vec![Arc::new(InboundMessage::text(1, 1, ""))];
        let unit = DispatchUnit::album(7, members).unwrap();
        assert!(retain_members(unit, |_| false).is_none());
    }

    #[test]
    fn retain_members_single() {
        let unit = DispatchUnit::single(InboundMessage::text(1, 1, "hi"));
        assert!(retain_members(unit.clone(), |_| true).is_some());
        assert!(retain_members(unit, |_| false).is_none());
    }
}
