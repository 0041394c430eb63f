//! In-memory rule set, persisted as `rules.json`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use tracing::{info, warn};

use crate::error::StoreError;
use crate::pipeline::rules::Rule;
use crate::pipeline::types::{ChatId, RuleResolver};
use crate::store::json::{JsonStore, RULES_FILE};

/// Source id → rule.
#[derive(Debug, Default)]
pub struct RuleBook {
    rules: RwLock<HashMap<ChatId, Rule>>,
}

impl RuleBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules<I>(rules: I) -> Self
    where
        I: IntoIterator<Item = (ChatId, Rule)>,
    {
        Self {
            rules: RwLock::new(rules.into_iter().collect()),
        }
    }

    /// Load from the store. Entries whose key is not a chat id are skipped.
    pub async fn load(store: &JsonStore) -> Result<Self, StoreError> {
        let raw: BTreeMap<String, Rule> = store.load_map(RULES_FILE).await?;
        let mut rules = HashMap::with_capacity(raw.len());
        for (key, rule) in raw {
            match key.trim().parse::<ChatId>() {
                Ok(source_id) => {
                    rules.insert(source_id, rule);
                }
                Err(_) => warn!(key = %key, "Skipping rule with non-numeric source id"),
            }
        }
        info!(count = rules.len(), "Loaded forwarding rules");
        Ok(Self {
            rules: RwLock::new(rules),
        })
    }

    pub async fn save(&self, store: &JsonStore) -> Result<(), StoreError> {
        let map: BTreeMap<String, Rule> = self
            .read()
            .iter()
            .map(|(id, rule)| (id.to_string(), rule.clone()))
            .collect();
        store.save_map(RULES_FILE, &map).await
    }

    /// Insert or replace. Returns the previous rule.
    pub fn upsert(&self, source_id: ChatId, rule: Rule) -> Option<Rule> {
        self.write().insert(source_id, rule)
    }

    pub fn remove(&self, source_id: ChatId) -> Option<Rule> {
        self.write().remove(&source_id)
    }

    pub fn get(&self, source_id: ChatId) -> Option<Rule> {
        self.read().get(&source_id).cloned()
    }

    pub fn set_enabled(&self, source_id: ChatId, enabled: bool) -> bool {
        match self.write().get_mut(&source_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// All rules, ordered by source id.
    pub fn list(&self) -> Vec<(ChatId, Rule)> {
        let mut rules: Vec<_> = self
            .read()
            .iter()
            .map(|(id, rule)| (*id, rule.clone()))
            .collect();
        rules.sort_by_key(|(id, _)| *id);
        rules
    }

    pub fn enabled_sources(&self) -> Vec<ChatId> {
        let mut sources: Vec<_> = self
            .read()
            .iter()
            .filter(|(_, rule)| rule.enabled)
            .map(|(id, _)| *id)
            .collect();
        sources.sort_unstable();
        sources
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ChatId, Rule>> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ChatId, Rule>> {
        self.rules.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RuleResolver for RuleBook {
    fn resolve_rule(&self, source_id: ChatId) -> Option<Rule> {
        self.get(source_id)
    }
}
