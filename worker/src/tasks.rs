//! Per-key background task registry: each key owns at most one task plus a
//! shared status slot the task and its observers communicate through.
//! Results are consumed by explicit removal.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::task::JoinHandle;

struct Entry<S> {
    handle: JoinHandle<()>,
    shared: Arc<S>,
}

pub struct TaskRegistry<K, S> {
    inner: Mutex<HashMap<K, Entry<S>>>,
}

impl<K: Eq + Hash + Clone, S> Default for TaskRegistry<K, S> {
    fn default() -> Self {
        TaskRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, S> TaskRegistry<K, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a task for `key` unless one is already registered. The
    /// factory runs under the registry lock, so it must only spawn.
    pub fn add_if_new(&self, key: K, spawn: impl FnOnce() -> (JoinHandle<()>, Arc<S>)) {
        let mut inner = self.inner.lock();
        if !inner.contains_key(&key) {
            let (handle, shared) = spawn();
            inner.insert(key, Entry { handle, shared });
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Whether the task for `key` exists and has not finished.
    pub fn is_running(&self, key: &K) -> bool {
        self.inner
            .lock()
            .get(key)
            .map_or(false, |entry| !entry.handle.is_finished())
    }

    pub fn get(&self, key: &K) -> Option<Arc<S>> {
        self.inner.lock().get(key).map(|entry| entry.shared.clone())
    }

    /// Consumes the entry, returning its status slot. The task itself is
    /// left to finish (or has already).
    pub fn remove(&self, key: &K) -> Option<Arc<S>> {
        self.inner.lock().remove(key).map(|entry| entry.shared)
    }

    /// Tears the registry down, aborting whatever is still running.
    pub fn abort_all(&self) {
        for entry in self.inner.lock().values() {
            entry.handle.abort();
        }
        self.inner.lock().clear();
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().keys().cloned().collect()
    }
}
