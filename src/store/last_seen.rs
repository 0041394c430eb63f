//! Per-source highwater mark of the newest forwarded message id.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::pipeline::types::{ChatId, MessageId};
use crate::store::json::{JsonStore, LAST_SEEN_FILE};

/// Cached last-seen ids, optionally backed by `last_seen.json`.
#[derive(Debug, Default)]
pub struct LastSeenIds {
    ids: Mutex<HashMap<ChatId, MessageId>>,
    store: Option<JsonStore>,
}

impl LastSeenIds {
    /// In-memory only.
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(store: JsonStore) -> Result<Self, StoreError> {
        let raw: BTreeMap<String, MessageId> = store.load_map(LAST_SEEN_FILE).await?;
        let ids = raw
            .into_iter()
            .filter_map(|(key, id)| match key.trim().parse::<ChatId>() {
                Ok(source_id) => Some((source_id, id)),
                Err(_) => {
                    warn!(key = %key, "Skipping last-seen entry with non-numeric source id");
                    None
                }
            })
            .collect();
        Ok(Self {
            ids: Mutex::new(ids),
            store: Some(store),
        })
    }

    pub fn get(&self, source_id: ChatId) -> Option<MessageId> {
        self.lock().get(&source_id).copied()
    }

    /// Move the mark forward. Returns `false` if `id` is not newer.
    pub fn advance(&self, source_id: ChatId, id: MessageId) -> bool {
        let mut ids = self.lock();
        let current = ids.entry(source_id).or_insert(0);
        if id <= *current {
            return false;
        }
        debug!(source_id, from = *current, to = id, "Advancing last-seen id");
        *current = id;
        true
    }

    pub fn snapshot(&self) -> BTreeMap<ChatId, MessageId> {
        self.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }

    /// Write to the backing store, if any.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let map: BTreeMap<String, MessageId> = self
            .snapshot()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        store.save_map(LAST_SEEN_FILE, &map).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ChatId, MessageId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn advance_is_monotonic() {
        let ids = LastSeenIds::new();
        assert!(ids.advance(1, 10));
        assert!(!ids.advance(1, 9));
        assert!(!ids.advance(1, 10));
        assert!(ids.advance(1, 11));
        assert_eq!(ids.get(1), Some(11));
        assert_eq!(ids.get(2), None);
    }

    #[tokio::test]
    async fn persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let ids = LastSeenIds::load(JsonStore::new(dir.path())).await.unwrap();
        ids.advance(-100, 500);
        ids.persist().await.unwrap();

        let reloaded = LastSeenIds::load(JsonStore::new(dir.path())).await.unwrap();
        assert_eq!(reloaded.get(-100), Some(500));
    }

    #[tokio::test]
    async fn persist_without_store_is_noop() {
        let ids = LastSeenIds::new();
        ids.advance(1, 1);
        assert!(ids.persist().await.is_ok());
    }
}
