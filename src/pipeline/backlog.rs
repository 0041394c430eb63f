//! Backlog catch-up: unread messages and recent history.
//!
//! Both scans fetch from a [`HistorySource`], sort oldest first, regroup
//! albums, pre-check filters and push the survivors onto the dispatch queue
//! as a manual producer. The worker still runs the full pipeline on them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{ChannelError, PipelineError};
use crate::pipeline::dispatch::WorkItem;
use crate::pipeline::forwarder::Forwarder;
use crate::pipeline::types::{ChatId, DispatchUnit, InboundMessage, MessageId};

/// Most unread messages fetched per source.
pub const UNREAD_LIMIT: usize = 500;

/// Page size for history scans.
pub const HISTORY_PAGE_SIZE: usize = 100;

/// Pause between history pages.
const PAGE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on any single history request.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Read access to a source's message history.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Newest message id the platform considers read.
    async fn read_boundary(&self, source_id: ChatId) -> Result<MessageId, ChannelError>;

    /// Up to `limit` messages with id greater than `min_id`.
    async fn fetch_after(
        &self,
        source_id: ChatId,
        min_id: MessageId,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ChannelError>;

    /// Up to `limit` messages older than `offset_id`, newest first.
    /// An `offset_id` of 0 starts from the newest message.
    async fn fetch_page(
        &self,
        source_id: ChatId,
        offset_id: MessageId,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ChannelError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacklogReport {
    pub source_id: ChatId,
    /// Units pushed onto the dispatch queue.
    pub queued: usize,
    /// Units that would not pass the rule's filters.
    pub skipped: usize,
}

async fn fetch<T, F>(source_id: ChatId, request: F) -> Result<T, PipelineError>
where
    F: std::future::Future<Output = Result<T, ChannelError>>,
{
    match tokio::time::timeout(FETCH_TIMEOUT, request).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(PipelineError::HistoryFetch {
            source_id,
            reason: e.to_string(),
        }),
        Err(_) => Err(PipelineError::HistoryFetch {
            source_id,
            reason: format!("timed out after {}s", FETCH_TIMEOUT.as_secs()),
        }),
    }
}

/// Consecutive members of the same media group become one album unit.
/// Expects `messages` sorted by id.
fn group_units(messages: Vec<InboundMessage>) -> Vec<DispatchUnit> {
    let mut units = Vec::new();
    let mut pending: Vec<Arc<InboundMessage>> = Vec::new();
    let mut pending_group = 0;

    fn flush(pending: &mut Vec<Arc<InboundMessage>>, group_id: i64, units: &mut Vec<DispatchUnit>) {
        if let Some(unit) = DispatchUnit::album(group_id, std::mem::take(pending)) {
            units.push(unit);
        }
    }

    for message in messages {
        if message.group_id != 0 && message.group_id == pending_group {
            pending.push(Arc::new(message));
            continue;
        }
        flush(&mut pending, pending_group, &mut units);
        if message.group_id != 0 {
            pending_group = message.group_id;
            pending.push(Arc::new(message));
        } else {
            pending_group = 0;
            units.push(DispatchUnit::single(message));
        }
    }
    flush(&mut pending, pending_group, &mut units);
    units
}

impl Forwarder {
    /// Forward everything after the unread boundary: the later of the
    /// platform's read marker and the last forwarded id.
    pub async fn catch_up_unread(
        &self,
        history: &dyn HistorySource,
        source_id: ChatId,
    ) -> Result<BacklogReport, PipelineError> {
        self.require_rule(source_id)?;

        let read = fetch(source_id, history.read_boundary(source_id)).await?;
        let boundary = read.max(self.deps.last_seen.get(source_id).unwrap_or(0));
        let mut messages = fetch(
            source_id,
            history.fetch_after(source_id, boundary, UNREAD_LIMIT),
        )
        .await?;
        messages.retain(|m| m.id > boundary);

        info!(source_id, boundary, fetched = messages.len(), "Catching up unread messages");
        self.queue_backlog(source_id, messages)
    }

    /// Forward the last `days` days of history.
    pub async fn catch_up_history(
        &self,
        history: &dyn HistorySource,
        source_id: ChatId,
        days: u32,
    ) -> Result<BacklogReport, PipelineError> {
        self.require_rule(source_id)?;

        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let mut collected = Vec::new();
        let mut offset_id: MessageId = 0;

        'pages: loop {
            let page = fetch(
                source_id,
                history.fetch_page(source_id, offset_id, HISTORY_PAGE_SIZE),
            )
            .await?;
            let Some(oldest) = page.iter().map(|m| m.id).min() else {
                break;
            };

            for message in page {
                if message.date < cutoff {
                    break 'pages;
                }
                collected.push(message);
            }

            // Offsets must strictly decrease or the scan would loop forever.
            if oldest <= 0 || (offset_id != 0 && oldest >= offset_id) {
                break;
            }
            offset_id = oldest;
            tokio::time::sleep(PAGE_DELAY).await;
        }

        info!(source_id, days, fetched = collected.len(), "Catching up history");
        self.queue_backlog(source_id, collected)
    }

    /// Unread catch-up over several sources. Failures are logged and skipped.
    pub async fn catch_up_all_unread(
        &self,
        history: &dyn HistorySource,
        sources: &[ChatId],
    ) -> Vec<BacklogReport> {
        let mut reports = Vec::with_capacity(sources.len());
        for &source_id in sources {
            match self.catch_up_unread(history, source_id).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(source_id, error = %e, "Unread catch-up failed"),
            }
        }
        reports
    }

    /// History catch-up over several sources. Failures are logged and skipped.
    pub async fn catch_up_all_history(
        &self,
        history: &dyn HistorySource,
        sources: &[ChatId],
        days: u32,
    ) -> Vec<BacklogReport> {
        let mut reports = Vec::with_capacity(sources.len());
        for &source_id in sources {
            match self.catch_up_history(history, source_id, days).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(source_id, error = %e, "History catch-up failed"),
            }
        }
        reports
    }

    fn require_rule(&self, source_id: ChatId) -> Result<(), PipelineError> {
        match self.deps.rules.resolve_rule(source_id) {
            Some(rule) if rule.enabled => Ok(()),
            _ => Err(PipelineError::NoRule(source_id)),
        }
    }

    fn queue_backlog(
        &self,
        source_id: ChatId,
        mut messages: Vec<InboundMessage>,
    ) -> Result<BacklogReport, PipelineError> {
        let rule = self
            .deps
            .rules
            .resolve_rule(source_id)
            .ok_or(PipelineError::NoRule(source_id))?;

        messages.sort_by_key(|m| m.id);
        messages.dedup_by_key(|m| m.id);

        let mut report = BacklogReport {
            source_id,
            ..BacklogReport::default()
        };
        for unit in group_units(messages) {
            let author = unit
                .first()
                .author_id
                .and_then(|id| self.deps.authors.author_info(id));
            if !self.filters.would_pass(&unit, &rule, author.as_ref()) {
                debug!(source_id, key = %unit.key(), "Backlog item filtered out");
                report.skipped += 1;
                continue;
            }
            self.queue.push(WorkItem::Fresh(unit))?;
            report.queued += 1;
        }

        info!(
            source_id,
            queued = report.queued,
            skipped = report.skipped,
            "Backlog queued"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_consecutive_album_members() {
        let messages = vec![
            InboundMessage::text(1, 1, "a"),
            InboundMessage::text(1, 2, "").with_group(9),
            InboundMessage::text(1, 3, "").with_group(9),
            InboundMessage::text(1, 4, "b"),
            InboundMessage::text(1, 5, "").with_group(10),
            InboundMessage::text(1, 6, "").with_group(11),
        ];
        let units = group_units(messages);
        let shapes: Vec<_> = units.iter().map(|u| (u.is_album(), u.len())).collect();
        assert_eq!(
            shapes,
            vec![(false, 1), (true, 2), (false, 1), (true, 1), (true, 1)]
        );
    }

    #[test]
    fn empty_input_has_no_units() {
        assert!(group_units(Vec::new()).is_empty());
    }
}
