//! Cache Store: per-key state with synchronous change notification.
//!
//! Every write goes through [`CacheStore::set`], which merges a
//! [`StatePatch`] onto the visible record, advances the logical timestamp
//! when `data` or `error` changed, stores the result and then notifies every
//! subscriber of the key with that same record.
//!
//! A store may have a parent. Reads that miss locally fall through to the
//! parent; writes always land locally. This is how scoped engines see their
//! parent's data without touching it.

mod memory;
mod traits;

pub use memory::InMemoryBackend;
pub use traits::{CacheBackend, CacheStats};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use revalia_core::{StatePatch, StateRecord};
use tracing::trace;

use crate::registry::SubscriberRegistry;

/// Equality used to decide whether a data write is a change.
pub type CompareFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

pub struct CacheStore<T> {
    backend: Arc<dyn CacheBackend<T>>,
    parent: Option<Arc<CacheStore<T>>>,
    registry: Arc<SubscriberRegistry<T>>,
    clock: Arc<AtomicU64>,
    compare: CompareFn<T>,
    write_lock: Mutex<()>,
}

impl<T> CacheStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        backend: Arc<dyn CacheBackend<T>>,
        registry: Arc<SubscriberRegistry<T>>,
        compare: CompareFn<T>,
    ) -> Self {
        Self {
            backend,
            parent: None,
            registry,
            clock: Arc::new(AtomicU64::new(0)),
            compare,
            write_lock: Mutex::new(()),
        }
    }

    /// A store layered over `parent`. The logical clock is shared so
    /// timestamps stay comparable across the two layers.
    pub fn child(
        parent: &Arc<CacheStore<T>>,
        backend: Arc<dyn CacheBackend<T>>,
        registry: Arc<SubscriberRegistry<T>>,
    ) -> Self {
        Self {
            backend,
            parent: Some(Arc::clone(parent)),
            registry,
            clock: Arc::clone(&parent.clock),
            compare: Arc::clone(&parent.compare),
            write_lock: Mutex::new(()),
        }
    }

    /// Visible record for `key`: local first, then the parent chain.
    pub fn get(&self, key: &str) -> Option<StateRecord<T>> {
        self.backend
            .get(key)
            .or_else(|| self.parent.as_ref().and_then(|p| p.get(key)))
    }

    /// Visible record for `key`, or the empty record.
    pub fn get_or_default(&self, key: &str) -> StateRecord<T> {
        self.get(key).unwrap_or_default()
    }

    /// Merge `patch` into `key`'s record and notify its subscribers.
    ///
    /// Subscribers are notified on every call, including flag-only patches.
    /// The timestamp only advances when `data` or `error` changed.
    pub fn set(&self, key: &str, patch: StatePatch<T>) -> StateRecord<T> {
        let record = {
            let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let base = self.get_or_default(key);
            let compare = &self.compare;
            let (mut merged, changed) = patch.apply(&base, |a, b| compare(a, b));
            if changed {
                merged.timestamp = self.tick(base.timestamp);
            }
            self.backend.set(key, merged.clone());
            merged
        };

        trace!(
            key = %key,
            timestamp = record.timestamp,
            is_validating = record.is_validating,
            has_data = record.has_data(),
            has_error = record.has_error(),
            "cache write"
        );
        self.registry.notify(key, &record);
        record
    }

    /// Put `key`'s data and error back to `snapshot`, or clear them when
    /// there was none. The in-progress flags describe the key now, not when
    /// the snapshot was taken: `in_progress` says whether a fetch or retry
    /// still runs. The timestamp keeps advancing.
    pub fn restore(
        &self,
        key: &str,
        snapshot: Option<&StateRecord<T>>,
        in_progress: bool,
    ) -> StateRecord<T> {
        let empty = StateRecord::default();
        let snapshot = snapshot.unwrap_or(&empty);
        let patch = StatePatch::replace_with(snapshot)
            .validating(in_progress)
            .loading(in_progress && !snapshot.has_data());
        self.set(key, patch)
    }

    /// Remove the local record for `key` and notify subscribers with
    /// whatever is visible afterwards.
    pub fn delete(&self, key: &str) -> bool {
        let removed = {
            let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.backend.delete(key)
        };
        if removed {
            self.registry.notify(key, &self.get_or_default(key));
        }
        removed
    }

    /// Keys stored locally.
    pub fn keys(&self) -> Vec<String> {
        self.backend.keys()
    }

    pub fn stats(&self) -> CacheStats {
        self.backend.stats()
    }

    fn tick(&self, floor: u64) -> u64 {
        let next = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        next.max(floor + 1)
    }
}
