//! Blocking Adapter: read a key as ready data or as a pending fetch.
//!
//! A blocking reader without data gets the key's in-flight [`FetchHandle`]
//! to wait on. The fetch is driven by the engine, so its result is
//! committed whether or not anyone is still waiting.

use revalia_core::{CacheKey, Key, SharedFetcher, SuspenseError};
use tracing::trace;

use crate::engine::{RevalidateOptions, SwrEngine};
use crate::handle::FetchHandle;
use crate::CacheValue;

/// Result of a blocking read.
#[derive(Debug)]
pub enum Suspense<T> {
    /// Data is available now.
    Ready(T),
    /// Wait on this fetch, then read again.
    Pending(FetchHandle<T>),
}

impl<T> Suspense<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn into_ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::Pending(_) => None,
        }
    }
}

impl<T: CacheValue> SwrEngine<T> {
    /// Read `key` for a blocking consumer.
    ///
    /// Resolution order: cached data, a cached error, `fallback`, the
    /// engine's fallback map, the pending in-flight fetch, and finally a new
    /// deduplicated fetch.
    pub fn read(
        &self,
        key: &Key,
        fetcher: SharedFetcher<T>,
        fallback: Option<T>,
    ) -> Result<Suspense<T>, SuspenseError> {
        let CacheKey::Active(active) = self.serialize(key) else {
            return Err(SuspenseError::Inactive);
        };
        let serialized = active.serialized();

        if let Some(state) = self.inner.store.get(serialized) {
            if let Some(data) = state.data {
                return Ok(Suspense::Ready(data));
            }
            if let Some(error) = state.error {
                if !state.is_validating {
                    return Err(SuspenseError::Rejected(error));
                }
            }
        }

        if let Some(data) = fallback.or_else(|| self.inner.fallback_for(serialized)) {
            return Ok(Suspense::Ready(data));
        }

        if let Some(handle) = self.inner.coordinator.pending(serialized) {
            trace!(key = %serialized, "Suspending on in-flight fetch");
            return Ok(Suspense::Pending(handle));
        }

        trace!(key = %serialized, "Suspending on new fetch");
        let handle = self
            .inner
            .revalidate_active(&active, fetcher, RevalidateOptions::deduped());
        Ok(Suspense::Pending(handle))
    }

    /// Wait until `key` has data.
    ///
    /// A rejected fetch is returned as [`SuspenseError::Rejected`]. Any retry
    /// it scheduled keeps running and will be picked up by the next read.
    pub async fn suspend(
        &self,
        key: &Key,
        fetcher: SharedFetcher<T>,
        fallback: Option<T>,
    ) -> Result<T, SuspenseError> {
        match self.read(key, fetcher, fallback)? {
            Suspense::Ready(value) => Ok(value),
            Suspense::Pending(handle) => handle.await.map_err(SuspenseError::Rejected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use revalia_core::{fetcher_fn, FetchError, KeyArg, SwrConfig};

    fn fetcher(calls: Arc<AtomicUsize>, fail: bool) -> SharedFetcher<u32> {
        fetcher_fn(move |_: Vec<KeyArg>| {
            let calls = Arc::clone(&calls);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(FetchError::msg("down"))
                } else {
                    Ok(42)
                }
            }
        })
    }

    fn engine() -> SwrEngine<u32> {
        SwrEngine::builder()
            .config(SwrConfig::default().with_retry_on_error(false))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_key_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = engine().read(&Key::Inactive, fetcher(calls, false), None);
        assert!(matches!(result, Err(SuspenseError::Inactive)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_ready() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = Key::from("/api/n");

        let first = engine.read(&key, fetcher(calls.clone(), false), None).unwrap();
        let Suspense::Pending(handle) = first else {
            panic!("expected pending");
        };
        let second = engine.read(&key, fetcher(calls.clone(), false), None).unwrap();
        assert!(matches!(&second, Suspense::Pending(h) if h.generation() == handle.generation()));

        assert_eq!(handle.await.unwrap(), 42);
        let third = engine.read(&key, fetcher(calls.clone(), false), None).unwrap();
        assert_eq!(third.into_ready(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_still_commits() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = Key::from("k");

        drop(engine.read(&key, fetcher(calls.clone(), false), None).unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(engine.get_data(&key), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_surfaces() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = Key::from("k");

        let err = engine
            .suspend(&key, fetcher(calls.clone(), true), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SuspenseError::Rejected(ref e) if e.message() == "down"));

        let again = engine.read(&key, fetcher(calls.clone(), true), None);
        assert!(matches!(again, Err(SuspenseError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_is_ready() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let ready = engine
            .read(&Key::from("k"), fetcher(calls.clone(), false), Some(7))
            .unwrap();
        assert_eq!(ready.into_ready(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
