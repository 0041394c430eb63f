//! Deferral of units whose media or reply target is not available yet.
//!
//! A deferred unit waits under its event key for `deferral_timeout`, then goes
//! back onto the dispatch queue as a retry. It skips triage on the way back
//! (no re-grouping) and the rate-limit check it already passed, but runs the
//! pre-send dedup and filters again.

use std::time::Duration;

use tracing::{info, warn};

use crate::pipeline::dispatch::{DispatchQueue, WorkItem};
use crate::pipeline::timers::KeyedTimers;
use crate::pipeline::types::{DispatchUnit, EventKey, MediaState};

/// Whether a unit can be sent now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// A member's media is not downloadable yet.
    IncompleteMedia,
    /// A member replies to a message whose content has not loaded yet.
    MissingReply,
}

impl Readiness {
    pub fn of(unit: &DispatchUnit) -> Self {
        let messages = unit.messages();
        if messages
            .iter()
            .any(|m| m.media_state == MediaState::Incomplete)
        {
            Self::IncompleteMedia
        } else if messages.iter().any(|m| m.has_pending_reply_reference()) {
            Self::MissingReply
        } else {
            Self::Ready
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::IncompleteMedia => "incomplete_media",
            Self::MissingReply => "missing_reply",
        }
    }
}

/// Holds not-ready units and re-injects them on timeout or manual release.
#[derive(Clone)]
pub struct DeferralManager {
    pending: KeyedTimers<EventKey, DispatchUnit>,
    queue: DispatchQueue,
    timeout: Duration,
}

impl DeferralManager {
    pub fn new(queue: DispatchQueue, timeout: Duration) -> Self {
        Self {
            pending: KeyedTimers::new(),
            queue,
            timeout,
        }
    }

    /// Park `unit` under `key`. An existing entry for the key is kept as is,
    /// with its original timer. Returns `true` if a new entry was created.
    pub async fn defer(&self, key: EventKey, unit: DispatchUnit, reason: Readiness) -> bool {
        info!(
            source_id = unit.source_id(),
            key = %key,
            reason = reason.label(),
            timeout_ms = self.timeout.as_millis() as u64,
            "Deferring until dependencies load"
        );
        let queue = self.queue.clone();
        self.pending
            .update_or_arm(
                key,
                self.timeout,
                || unit,
                |_| {},
                move |key, unit| {
                    if queue.push(WorkItem::Retry(unit)).is_err() {
                        warn!(key = %key, "Deferral fired after the dispatch queue closed");
                    }
                },
            )
            .await
    }

    /// Cancel the pending entry for `key` because a fresh event replaced it.
    pub async fn supersede(&self, key: &EventKey) -> bool {
        self.pending.take(key).await.is_some()
    }

    /// Cancel the timer for `key` and retry it right away.
    pub async fn release(&self, key: &EventKey) -> bool {
        let Some(unit) = self.pending.take(key).await else {
            return false;
        };
        if self.queue.push(WorkItem::Retry(unit)).is_err() {
            warn!(key = %key, "Cannot release deferral, dispatch queue closed");
            return false;
        }
        true
    }

    /// Retry every pending unit now. Returns how many were re-queued.
    pub async fn release_all(&self) -> usize {
        let mut released = 0;
        for (key, unit) in self.pending.drain().await {
            if self.queue.push(WorkItem::Retry(unit)).is_err() {
                warn!(key = %key, "Cannot release deferral, dispatch queue closed");
                continue;
            }
            released += 1;
        }
        released
    }

    pub async fn is_pending(&self, key: &EventKey) -> bool {
        self.pending.contains(key).await
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.len().await
    }

    /// Cancel every timer without retrying. Used on shutdown.
    pub async fn abandon_all(&self) -> usize {
        let abandoned = self.pending.drain().await;
        for (key, unit) in &abandoned {
            warn!(
                source_id = unit.source_id(),
                key = %key,
                messages = unit.len(),
                "Abandoning deferred item on shutdown"
            );
        }
        abandoned.len()
    }
}
