//! Versioned key/value store shared across orchestrator subsystems.
//!
//! Every mutation takes a per-key lock and bumps a single global version
//! counter, so versions give a happens-before order across all keys.
//! Subscribers are notified asynchronously after each successful
//! mutation; a slow or failing subscriber never affects the mutator.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

/// Notification delivered to subscribers after a successful mutation.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub key: String,
    pub value: Value,
    pub version: u64,
}

#[derive(Debug)]
struct Entry {
    value: Value,
    version: u64,
}

type Handler = Box<dyn Fn(StateChange) -> crate::Result<()> + Send + Sync>;

pub struct StateStore {
    entries: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<StateChange>>>>,
    version: AtomicU64,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Replace the value under `key`, returning the new version.
    pub async fn set(&self, key: &str, value: Value) -> u64 {
        let entry = self.entry_for(key).await;
        let mut guard = entry.lock().await;
        let version = self.next_version();
        guard.value = value.clone();
        guard.version = version;
        // Notify while the per-key lock is held so subscribers observe
        // changes to one key in version order.
        self.notify(key, value, version).await;
        version
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_versioned(key).await.map(|(value, _)| value)
    }

    pub async fn get_versioned(&self, key: &str) -> Option<(Value, u64)> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?.clone();
        drop(entries);
        let guard = entry.lock().await;
        Some((guard.value.clone(), guard.version))
    }

    /// Compare-and-set: replaces the value only if the entry's version
    /// still equals `expected_version`. An `expected_version` of 0
    /// creates the key if it does not exist yet.
    pub async fn cas(&self, key: &str, expected_version: u64, new_value: Value) -> bool {
        let entry = self.entry_for(key).await;
        let mut guard = entry.lock().await;
        if guard.version != expected_version {
            debug!(
                key,
                expected = expected_version,
                current = guard.version,
                "CAS rejected"
            );
            return false;
        }
        let version = self.next_version();
        guard.value = new_value.clone();
        guard.version = version;
        self.notify(key, new_value, version).await;
        true
    }

    /// Register a subscriber for mutations of `key`.
    ///
    /// The handler runs on its own drainer task; deliveries for one key
    /// arrive in version order, at least once. Handler errors are logged
    /// and never propagate to the mutator.
    pub async fn subscribe<F>(&self, key: &str, handler: F)
    where
        F: Fn(StateChange) -> crate::Result<()> + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<StateChange>();
        {
            let mut subscribers = self.subscribers.write().await;
            subscribers.entry(key.to_string()).or_default().push(tx);
        }

        let handler: Handler = Box::new(handler);
        let key = key.to_string();
        tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                if let Err(e) = handler(change) {
                    warn!("State subscriber for {} failed: {}", key, e);
                }
            }
        });
    }

    /// Drop a key outright. Subscribers are not notified; this is for
    /// retention trimming, not for signalling.
    pub async fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        entries.remove(key).is_some()
    }

    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    async fn entry_for(&self, key: &str) -> Arc<Mutex<Entry>> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                return entry.clone();
            }
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Entry {
                    value: Value::Null,
                    version: 0,
                }))
            })
            .clone()
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn notify(&self, key: &str, value: Value, version: u64) {
        let subscribers = self.subscribers.read().await;
        let Some(senders) = subscribers.get(key) else {
            return;
        };
        let change = StateChange {
            key: key.to_string(),
            value,
            version,
        };
        for sender in senders {
            // A closed receiver just means the subscriber went away.
            let _ = sender.send(change.clone());
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
