//! Revalia Core - Key, State and Contract Types
//!
//! Shared vocabulary for the stale-while-revalidate engine. This crate holds
//! data types and the traits at the engine's edges (fetchers, observers, the
//! host platform); the behavior lives in `revalia-cache`.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod host;
pub mod key;
pub mod state;

pub use config::SwrConfig;
pub use error::{
    ConfigError, FetchError, KeyError, MutationError, RevaliaError, RevaliaResult, SuspenseError,
};
pub use fetcher::{fetcher_fn, FnFetcher, Fetcher, SharedFetcher};
pub use host::{HeadlessHost, Host, HostEvent, HostEventSender};
pub use key::{ActiveKey, CacheKey, IdentityMap, Key, KeyArg, KeySerializer, LazyKeyFn, ObjectRef};
pub use state::{StateObserver, StatePatch, StateRecord};

/// Per-key monotonically increasing dispatch counter.
pub type Generation = u64;
