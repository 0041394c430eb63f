//! Keyed one-shot timers holding a value until they fire or are cancelled.
//!
//! Backs both the album buffer and the deferral manager. Each key has at most
//! one live timer. Cancelling by key aborts the timer task; a timer that has
//! already woken but lost the race for the lock finds its generation replaced
//! and does nothing.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;

struct Slot<V> {
    value: V,
    generation: u64,
    timer: AbortHandle,
}

pub struct KeyedTimers<K, V> {
    slots: Arc<Mutex<HashMap<K, Slot<V>>>>,
    generations: Arc<AtomicU64>,
}

impl<K, V> Clone for KeyedTimers<K, V> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            generations: Arc::clone(&self.generations),
        }
    }
}

impl<K, V> Default for KeyedTimers<K, V> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<K, V> KeyedTimers<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the value under `key`, or create it and arm a timer for `delay`.
    ///
    /// The check and the mutation happen under one lock, so two concurrent
    /// callers for the same new key cannot both create it. Returns `true` if
    /// this call created the entry. `on_fire` receives the value once the
    /// timer expires and the entry has been removed.
    pub async fn update_or_arm<I, U, F>(
        &self,
        key: K,
        delay: Duration,
        init: I,
        update: U,
        on_fire: F,
    ) -> bool
    where
        I: FnOnce() -> V,
        U: FnOnce(&mut V),
        F: FnOnce(K, V) + Send + 'static,
    {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(&key) {
            update(&mut slot.value);
            return false;
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let fire_key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(value) = this.expire(&fire_key, generation).await {
                on_fire(fire_key, value);
            }
        });

        slots.insert(
            key,
            Slot {
                value: init(),
                generation,
                timer: task.abort_handle(),
            },
        );
        true
    }

    /// Cancel the timer for `key` and hand back its value.
    pub async fn take(&self, key: &K) -> Option<V> {
        let slot = self.slots.lock().await.remove(key)?;
        slot.timer.abort();
        Some(slot.value)
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.slots.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<K> {
        self.slots.lock().await.keys().cloned().collect()
    }

    /// Cancel every timer and return the held values.
    pub async fn drain(&self) -> Vec<(K, V)> {
        let mut slots = self.slots.lock().await;
        slots
            .drain()
            .map(|(key, slot)| {
                slot.timer.abort();
                (key, slot.value)
            })
            .collect()
    }

    async fn expire(&self, key: &K, generation: u64) -> Option<V> {
        let mut slots = self.slots.lock().await;
        if slots.get(key).is_some_and(|s| s.generation == generation) {
            slots.remove(key).map(|s| s.value)
        } else {
            None
        }
    }
}
