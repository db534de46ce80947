//! In-memory cache backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use revalia_core::StateRecord;

use super::traits::{CacheBackend, CacheStats};

/// `HashMap` backed store. The default backend of every engine.
pub struct InMemoryBackend<T> {
    entries: RwLock<HashMap<String, StateRecord<T>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl<T> InMemoryBackend<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for InMemoryBackend<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> CacheBackend<T> for InMemoryBackend<T> {
    fn get(&self, key: &str) -> Option<StateRecord<T>> {
        let found = self
            .entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).cloned());
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    fn set(&self, key: &str, record: StateRecord<T>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.to_string(), record);
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn delete(&self, key: &str) -> bool {
        self.entries
            .write()
            .map(|mut entries| entries.remove(key).is_some())
            .unwrap_or(false)
    }

    fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}
