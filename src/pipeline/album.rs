//! Album buffer: collects media-group members until the group goes quiet.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::pipeline::dispatch::{DispatchQueue, WorkItem};
use crate::pipeline::timers::KeyedTimers;
use crate::pipeline::types::{ChatId, DispatchUnit, InboundMessage};

/// Groups are keyed by source as well as group id.
type GroupKey = (ChatId, i64);

#[derive(Clone)]
pub struct AlbumBuffer {
    groups: KeyedTimers<GroupKey, Vec<Arc<InboundMessage>>>,
    queue: DispatchQueue,
    timeout: Duration,
}

impl AlbumBuffer {
    pub fn new(queue: DispatchQueue, timeout: Duration) -> Self {
        Self {
            groups: KeyedTimers::new(),
            queue,
            timeout,
        }
    }

    /// Add a member. Returns `Some(true)` if it started a new group, `None`
    /// if the dispatch queue is closed and the member was refused.
    ///
    /// When the group's timer fires, its members go onto the dispatch queue
    /// as one unit sorted by message id.
    pub async fn add(&self, message: Arc<InboundMessage>) -> Option<bool> {
        let key = (message.source_id, message.group_id);
        let queue = self.queue.clone();
        let appended = Arc::clone(&message);

        let created = self
            .groups
            .update_or_arm(
                key,
                self.timeout,
                || vec![message],
                |members| members.push(appended),
                move |(source_id, group_id), members| {
                    let count = members.len();
                    let Some(unit) = DispatchUnit::album(group_id, members) else {
                        return;
                    };
                    info!(source_id, group_id, count, "Album complete, queueing");
                    if queue.push(WorkItem::Fresh(unit)).is_err() {
                        warn!(source_id, group_id, "Album completed after the dispatch queue closed");
                    }
                },
            )
            .await;

        // Checked after arming: a queue still open here closes only after
        // shutdown's final drain, which then sees this group.
        if self.queue.is_closed() {
            if let Some(members) = self.groups.take(&key).await {
                warn!(
                    source_id = key.0,
                    group_id = key.1,
                    messages = members.len(),
                    "Refusing album member, dispatch queue is closed"
                );
            }
            return None;
        }

        if created {
            debug!(source_id = key.0, group_id = key.1, "Started album group");
        }
        Some(created)
    }

    pub async fn pending_groups(&self) -> usize {
        self.groups.len().await
    }

    /// Cancel every group timer without emitting. Used on shutdown.
    pub async fn abandon_all(&self) -> usize {
        let abandoned = self.groups.drain().await;
        for ((source_id, group_id), members) in &abandoned {
            warn!(
                source_id,
                group_id,
                messages = members.len(),
                "Abandoning buffered album on shutdown"
            );
        }
        abandoned.len()
    }
}
