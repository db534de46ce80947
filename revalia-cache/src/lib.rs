//! Revalia Cache - Stale-While-Revalidate Engine
//!
//! Serves cached data immediately and refreshes it in the background.
//! Concurrent requests for a key collapse into one fetch, subscribers of a
//! key are notified synchronously on every state change, local mutations
//! can be shown optimistically and rolled back, and failed fetches retry
//! with exponential backoff.
//!
//! ```ignore
//! let engine = SwrEngine::<User>::builder()
//!     .config(SwrConfig::from_env()?)
//!     .host(host)
//!     .build();
//!
//! let sub = engine.subscribe(&Key::from("/api/user"), fetcher, observer);
//! let user = sub.data();
//!
//! engine
//!     .mutate(&Key::from("/api/user"), Mutation::Value(updated), MutateOptions::new().optimistic(preview))
//!     .await?;
//! ```

pub mod coordinator;
pub mod engine;
pub mod handle;
pub mod mutator;
pub mod registry;
pub mod retry;
pub mod store;
pub mod subscription;
pub mod suspense;
pub mod triggers;

pub use coordinator::{RequestCoordinator, Verdict};
pub use engine::{EngineBuilder, RevalidateOptions, SwrEngine};
pub use handle::{FetchHandle, TaskStatus};
pub use mutator::{MutateOptions, Mutation, OptimisticData, PopulateCache, Rollback};
pub use registry::{Binding, Subscriber, SubscriberId, SubscriberRegistry};
pub use retry::RetryPolicy;
pub use store::{CacheBackend, CacheStats, CacheStore, CompareFn, InMemoryBackend};
pub use subscription::{SubscribeOptions, Subscription};
pub use suspense::Suspense;
pub use triggers::{RefreshIntervalFn, Trigger};

pub use revalia_core::{
    fetcher_fn, CacheKey, FetchError, Fetcher, Host, HostEvent, Key, KeyArg, MutationError,
    SharedFetcher, StateObserver, StateRecord, SuspenseError, SwrConfig,
};

/// Bound shared by every value the engine caches.
pub trait CacheValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> CacheValue for T {}
