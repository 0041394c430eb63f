//! Forwarder: triage intake and pipeline lifecycle.
//!
//! Constructed once at startup with its collaborators, torn down explicitly
//! with [`Forwarder::shutdown`]. Inbound events enter through
//! [`Forwarder::on_event`], which never blocks on the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ForwarderConfig;
use crate::error::{ConfigError, PipelineError};
use crate::pipeline::album::AlbumBuffer;
use crate::pipeline::deferral::DeferralManager;
use crate::pipeline::dispatch::{DispatchQueue, DispatchWorker, WorkItem};
use crate::pipeline::outcome::{OutcomeEvent, OutcomeSink, StatsSnapshot};
use crate::pipeline::rules::FilterEngine;
use crate::pipeline::types::{
    AuthorDirectory, DispatchUnit, EventKey, InboundMessage, MessageSender, PayloadBuilder,
    RuleResolver,
};
use crate::store::LastSeenIds;

/// Collaborators injected into the pipeline.
#[derive(Clone)]
pub struct ForwarderDeps {
    pub rules: Arc<dyn RuleResolver>,
    pub authors: Arc<dyn AuthorDirectory>,
    pub sender: Arc<dyn MessageSender>,
    pub payloads: Arc<dyn PayloadBuilder>,
    pub last_seen: Arc<LastSeenIds>,
}

/// Where triage routed an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Triage {
    /// No enabled rule for the source, or the forwarder is shutting down.
    /// Nothing was touched.
    Ignored,
    Queued,
    Buffered { new_group: bool },
}

/// How [`Forwarder::shutdown`] treats items still on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Process everything queued before the stop signal.
    Drain,
    /// Log and drop everything still queued.
    Abandon,
}

/// What was left behind on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub abandoned_queued: usize,
    pub abandoned_albums: usize,
    pub abandoned_deferred: usize,
}

pub struct Forwarder {
    pub(super) config: ForwarderConfig,
    pub(super) deps: ForwarderDeps,
    pub(super) filters: Arc<FilterEngine>,
    pub(super) queue: DispatchQueue,
    albums: AlbumBuffer,
    deferral: DeferralManager,
    outcomes: Arc<OutcomeSink>,
    abandon: Arc<AtomicBool>,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<usize>>>,
}

impl Forwarder {
    /// Validate `config` and spawn the dispatch worker.
    pub fn start(config: ForwarderConfig, deps: ForwarderDeps) -> Result<Self, ConfigError> {
        config.validate()?;

        let (queue, rx) = DispatchQueue::channel();
        let filters = Arc::new(FilterEngine::new(
            config.min_length,
            config.max_length,
            &config.global_keyword_pattern,
        ));
        let albums = AlbumBuffer::new(queue.clone(), config.album_timeout);
        let deferral = DeferralManager::new(queue.clone(), config.deferral_timeout);
        let outcomes = Arc::new(OutcomeSink::default());
        let abandon = Arc::new(AtomicBool::new(false));

        let worker = DispatchWorker::new(
            rx,
            &config,
            deps.clone(),
            Arc::clone(&filters),
            deferral.clone(),
            Arc::clone(&outcomes),
            Arc::clone(&abandon),
        );
        let handle = tokio::spawn(worker.run());

        info!(
            album_timeout_ms = config.album_timeout.as_millis() as u64,
            deferral_timeout_ms = config.deferral_timeout.as_millis() as u64,
            antispam_delay_ms = config.antispam_delay.as_millis() as u64,
            "Forwarder started"
        );

        Ok(Self {
            config,
            deps,
            filters,
            queue,
            albums,
            deferral,
            outcomes,
            abandon,
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Entry point for every inbound event. Returns `Ignored` once
    /// shutdown has begun.
    pub async fn on_event(&self, message: InboundMessage) -> Triage {
        let source_id = message.source_id;
        if self.closed.load(Ordering::SeqCst) || self.queue.is_closed() {
            debug!(source_id, message_id = message.id, "Ignoring event after shutdown");
            return Triage::Ignored;
        }
        let enabled = self
            .deps
            .rules
            .resolve_rule(source_id)
            .is_some_and(|r| r.enabled);
        if !enabled {
            return Triage::Ignored;
        }

        if message.group_id != 0 {
            return match self.albums.add(Arc::new(message)).await {
                Some(new_group) => Triage::Buffered { new_group },
                None => Triage::Ignored,
            };
        }

        debug!(source_id, message_id = message.id, "Queueing message");
        match self.queue.push(WorkItem::Fresh(DispatchUnit::single(message))) {
            Ok(()) => Triage::Queued,
            Err(e) => {
                warn!(source_id, error = %e, "Dropping event, pipeline is shut down");
                Triage::Ignored
            }
        }
    }

    /// Push a unit straight onto the dispatch queue, bypassing triage.
    pub fn submit(&self, unit: DispatchUnit) -> Result<(), PipelineError> {
        self.queue.push(WorkItem::Fresh(unit))
    }

    /// Retry a deferred unit now instead of waiting for its timer.
    pub async fn release_deferred(&self, key: &EventKey) -> bool {
        self.deferral.release(key).await
    }

    pub async fn release_all_deferred(&self) -> usize {
        self.deferral.release_all().await
    }

    pub async fn pending_deferrals(&self) -> usize {
        self.deferral.pending_count().await
    }

    pub async fn pending_albums(&self) -> usize {
        self.albums.pending_groups().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutcomeEvent> {
        self.outcomes.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.outcomes.stats()
    }

    /// Cancel all timers, stop the worker and wait for it.
    /// Calling it again returns an empty report.
    pub async fn shutdown(&self, mode: ShutdownMode) -> ShutdownReport {
        self.closed.store(true, Ordering::SeqCst);
        let Some(handle) = self.worker.lock().await.take() else {
            return ShutdownReport::default();
        };

        let mut abandoned_albums = self.albums.abandon_all().await;
        let mut abandoned_deferred = self.deferral.abandon_all().await;

        if mode == ShutdownMode::Abandon {
            self.abandon.store(true, Ordering::SeqCst);
        }
        if self.queue.push(WorkItem::Stop).is_err() {
            warn!("Dispatch worker already gone at shutdown");
        }

        let abandoned_queued = match handle.await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "Dispatch worker did not exit cleanly");
                0
            }
        };

        // Draining can defer items, and triage already past the closed check
        // can still buffer an album.
        abandoned_albums += self.albums.abandon_all().await;
        abandoned_deferred += self.deferral.abandon_all().await;

        let report = ShutdownReport {
            abandoned_queued,
            abandoned_albums,
            abandoned_deferred,
        };
        info!(
            abandoned_queued,
            abandoned_albums,
            abandoned_deferred,
            "Forwarder shut down"
        );
        report
    }
}
