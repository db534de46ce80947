//! Cache backend trait and usage statistics.

use revalia_core::StateRecord;

/// Pluggable storage for per-key state records.
///
/// Backends are plain key-value maps. They never notify anyone; the
/// [`CacheStore`](super::CacheStore) wrapping a backend owns notification,
/// timestamps and parent fallback. Calls are synchronous so a write and the
/// notification it triggers happen inside the same update.
///
/// Implementations must be thread-safe.
pub trait CacheBackend<T>: Send + Sync {
    /// Get the record stored under `key`.
    fn get(&self, key: &str) -> Option<StateRecord<T>>;

    /// Store `record` under `key`, replacing any previous record.
    fn set(&self, key: &str, record: StateRecord<T>);

    /// Remove `key`. Returns whether an entry existed.
    fn delete(&self, key: &str) -> bool;

    /// Every key currently stored.
    fn keys(&self) -> Vec<String>;

    /// Usage statistics.
    fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.keys().len() as u64,
            ..Default::default()
        }
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of reads that found a record.
    pub hits: u64,
    /// Number of reads that found nothing.
    pub misses: u64,
    /// Number of entries currently stored.
    pub entry_count: u64,
    /// Number of writes.
    pub writes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
