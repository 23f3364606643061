//! In-process [`KvStore`] with the same semantics as the etcd backend.
//!
//! Used by tests and single-process setups. Every mutation bumps a global
//! index and is appended to a bounded event history that watchers scan.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use corral_common::{CorralError, Result};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::store::{is_under, KeyValue, KvStore, WatchAction, WatchEvent};

/// Number of events retained for watchers that fall behind.
const DEFAULT_HISTORY: usize = 1000;

#[derive(Default)]
struct State {
    data: BTreeMap<String, KeyValue>,
    index: u64,
    history: VecDeque<WatchEvent>,
    /// Highest index dropped from `history`.
    cleared_up_to: u64,
}

impl State {
    fn record(&mut self, action: WatchAction, key: &str, capacity: usize) -> u64 {
        self.index += 1;
        self.history.push_back(WatchEvent {
            action,
            key: key.to_string(),
            index: self.index,
        });
        while self.history.len() > capacity {
            if let Some(evicted) = self.history.pop_front() {
                self.cleared_up_to = evicted.index;
            }
        }
        self.index
    }

    fn find_event(&self, prefix: &str, from: u64) -> Result<Option<WatchEvent>> {
        if from <= self.cleared_up_to {
            return Err(CorralError::TransientInfra(format!(
                "event index {} cleared (oldest retained {})",
                from,
                self.cleared_up_to + 1
            )));
        }
        Ok(self
            .history
            .iter()
            .find(|e| e.index >= from && is_under(prefix, &e.key))
            .cloned())
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
    index_tx: watch::Sender<u64>,
    history_capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    pub fn with_history(history_capacity: usize) -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            index_tx,
            history_capacity: history_capacity.max(1),
        }
    }

    /// Current modification index.
    pub fn index(&self) -> u64 {
        self.state.lock().index
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, index: u64) {
        self.index_tx.send_replace(index);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn create(&self, key: &str, value: String) -> Result<()> {
        let index = {
            let mut state = self.state.lock();
            if state.data.contains_key(key) {
                return Err(CorralError::Conflict(key.to_string()));
            }
            let index = state.record(WatchAction::Create, key, self.history_capacity);
            state.data.insert(
                key.to_string(),
                KeyValue {
                    key: key.to_string(),
                    value,
                    modified_index: index,
                },
            );
            index
        };
        self.publish(index);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<KeyValue> {
        self.state
            .lock()
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| CorralError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let index = {
            let mut state = self.state.lock();
            if state.data.remove(key).is_none() {
                return Err(CorralError::NotFound(key.to_string()));
            }
            state.record(WatchAction::Delete, key, self.history_capacity)
        };
        self.publish(index);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let state = self.state.lock();
        let entries: Vec<KeyValue> = state
            .data
            .values()
            .filter(|kv| kv.key != prefix && is_under(prefix, &kv.key))
            .cloned()
            .collect();

        if entries.is_empty() {
            return Err(CorralError::NotFound(prefix.to_string()));
        }
        Ok(entries)
    }

    async fn watch(&self, prefix: &str, wait_index: Option<u64>) -> Result<WatchEvent> {
        // Subscribe before reading the history so no publish is missed.
        let mut rx = self.index_tx.subscribe();
        let from = match wait_index {
            Some(index) => index,
            None => *rx.borrow_and_update() + 1,
        };

        loop {
            let found = self.state.lock().find_event(prefix, from)?;
            if let Some(event) = found {
                return Ok(event);
            }
            rx.changed()
                .await
                .map_err(|_| CorralError::TransientInfra("memory store dropped".into()))?;
        }
    }
}
