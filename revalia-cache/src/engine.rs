//! The engine: one cache, its subscribers and the machinery around them.
//!
//! [`SwrEngine`] is a cheap handle over shared state. Everything that runs
//! in the background (fetch drivers, retry timers, host listeners, refresh
//! loops) holds a weak reference, so dropping the last handle and every
//! subscription shuts the engine down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use revalia_core::{
    ActiveKey, CacheKey, FetchError, Generation, HeadlessHost, Host, HostEvent, Key,
    KeySerializer, SharedFetcher, StatePatch, StateRecord, SwrConfig,
};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::coordinator::{RequestCoordinator, Verdict};
use crate::handle::FetchHandle;
use crate::registry::SubscriberRegistry;
use crate::retry::{self, RetryPolicy, RetryTask};
use crate::store::{CacheBackend, CacheStore, CompareFn, InMemoryBackend};
use crate::triggers;
use crate::CacheValue;

/// Spawn onto the current tokio runtime, if there is one.
pub(crate) fn spawn_detached<F>(fut: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(fut)),
        Err(_) => {
            warn!("No tokio runtime available, background task not started");
            None
        }
    }
}

/// How a revalidation is dispatched.
#[derive(Clone)]
pub struct RevalidateOptions {
    /// Join an in-flight fetch started within the dedupe window.
    pub dedupe: bool,
    /// Overrides the engine config for this fetch and its retries.
    pub config: Option<Arc<SwrConfig>>,
    pub(crate) attempt: u32,
}

impl Default for RevalidateOptions {
    fn default() -> Self {
        Self::deduped()
    }
}

impl RevalidateOptions {
    pub fn deduped() -> Self {
        Self {
            dedupe: true,
            config: None,
            attempt: 0,
        }
    }

    /// Always start a new fetch.
    pub fn forced() -> Self {
        Self {
            dedupe: false,
            ..Self::deduped()
        }
    }

    pub fn with_config(mut self, config: SwrConfig) -> Self {
        self.config = Some(Arc::new(config));
        self
    }
}

/// Context a fetch carries to its completion.
struct Dispatched<T> {
    key: ActiveKey,
    fetcher: SharedFetcher<T>,
    generation: Generation,
    config: Arc<SwrConfig>,
    attempt: u32,
}

pub(crate) struct EngineInner<T> {
    pub(crate) config: Arc<SwrConfig>,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) keys: KeySerializer,
    pub(crate) store: Arc<CacheStore<T>>,
    pub(crate) registry: Arc<SubscriberRegistry<T>>,
    pub(crate) coordinator: RequestCoordinator<T>,
    pub(crate) fallback: HashMap<String, T>,
}

impl<T: CacheValue> EngineInner<T> {
    /// Join or start a fetch for `key` and publish the in-progress flags.
    pub(crate) fn revalidate_active(
        self: &Arc<Self>,
        key: &ActiveKey,
        fetcher: SharedFetcher<T>,
        options: RevalidateOptions,
    ) -> FetchHandle<T> {
        let attempt = options.attempt;
        let config = options.config.unwrap_or_else(|| Arc::clone(&self.config));
        let window = config.deduping_interval();
        let serialized = key.serialized();
        let weak = Arc::downgrade(self);

        let (handle, started) = self.coordinator.dispatch(
            serialized,
            options.dedupe,
            window,
            Instant::now(),
            move |generation| {
                let dispatched = Dispatched {
                    key: key.clone(),
                    fetcher,
                    generation,
                    config,
                    attempt,
                };
                FetchHandle::new(generation, run_fetch(weak, dispatched))
            },
        );

        match started {
            None => trace!(key = %key, "Joined in-flight fetch"),
            Some(generation) => {
                debug!(key = %key, generation, attempt, "Dispatching fetch");
                let has_data = self.store.get(serialized).is_some_and(|r| r.has_data());
                self.store.set(
                    serialized,
                    StatePatch::new().validating(true).loading(!has_data),
                );
                let driver = handle.clone();
                spawn_detached(async move {
                    let _ = driver.await;
                });
            }
        }
        handle
    }

    /// Revalidate through the first bound subscriber of `key`.
    pub(crate) fn revalidate_bound(
        self: &Arc<Self>,
        key: &str,
        dedupe: bool,
    ) -> Option<FetchHandle<T>> {
        let subscriber = self.registry.first_bound(key)?;
        let binding = subscriber.binding()?;
        Some(self.revalidate_active(
            &binding.key,
            Arc::clone(&binding.fetcher),
            RevalidateOptions {
                dedupe,
                config: Some(Arc::clone(&binding.config)),
                attempt: 0,
            },
        ))
    }

    pub(crate) fn fallback_for(&self, key: &str) -> Option<T> {
        self.fallback.get(key).cloned()
    }

    fn complete_fetch(self: &Arc<Self>, fetch: Dispatched<T>, result: &Result<T, FetchError>) {
        let key = fetch.key.serialized();

        let error = match result {
            Ok(data) => {
                match self.coordinator.finish(key, fetch.generation, true) {
                    Verdict::Commit => {
                        debug!(key = %key, generation = fetch.generation, "Fetch committed");
                        self.store.set(
                            key,
                            StatePatch::new().data(data.clone()).clear_error().settled(),
                        );
                        self.resolve_waiter(key, self.coordinator.take_waiter(key), Some(result));
                    }
                    Verdict::Discard { others_pending } => {
                        self.discard(key, fetch.generation, others_pending)
                    }
                }
                return;
            }
            Err(error) => error,
        };

        let policy = RetryPolicy::from_config(&fetch.config);
        if policy.allows(fetch.attempt) && self.coordinator.begin_retry(key, fetch.generation) {
            let watched = self.registry.count(key) > 0;
            retry::schedule(
                self,
                RetryTask {
                    key: fetch.key.clone(),
                    fetcher: Arc::clone(&fetch.fetcher),
                    config: Arc::clone(&fetch.config),
                    failed: fetch.generation,
                    attempt: fetch.attempt,
                    error: error.clone(),
                    watched,
                },
            );
            return;
        }

        match self.coordinator.finish(key, fetch.generation, false) {
            Verdict::Commit => {
                warn!(
                    key = %key,
                    generation = fetch.generation,
                    retries = fetch.attempt,
                    error = %error,
                    "Fetch failed"
                );
                self.store
                    .set(key, StatePatch::new().error(error.clone()).settled());
                self.resolve_waiter(key, self.coordinator.take_waiter(key), Some(result));
            }
            Verdict::Discard { others_pending } => {
                self.discard(key, fetch.generation, others_pending)
            }
        }
    }

    fn discard(&self, key: &str, generation: Generation, others_pending: bool) {
        debug!(key = %key, generation, "Discarding stale fetch result");
        if !others_pending {
            self.store.set(key, StatePatch::new().settled());
            self.resolve_waiter(key, self.coordinator.take_waiter(key), None);
        }
    }

    /// Wake blocking readers parked on a retry chain of `key`. Without an
    /// explicit `result` they get whatever the store holds now.
    pub(crate) fn resolve_waiter(
        &self,
        key: &str,
        waiter: Option<oneshot::Sender<Result<T, FetchError>>>,
        result: Option<&Result<T, FetchError>>,
    ) {
        let Some(tx) = waiter else {
            return;
        };
        let result = match result {
            Some(result) => result.clone(),
            None => {
                let record = self.store.get(key).unwrap_or_default();
                match (record.data, record.error) {
                    (Some(data), _) => Ok(data),
                    (None, Some(error)) => Err(error),
                    (None, None) => Err(FetchError::msg("retry abandoned")),
                }
            }
        };
        trace!(key = %key, ok = result.is_ok(), "Waking retry waiters");
        let _ = tx.send(result);
    }
}

async fn run_fetch<T: CacheValue>(
    engine: Weak<EngineInner<T>>,
    fetch: Dispatched<T>,
) -> Result<T, FetchError> {
    let result = fetch.fetcher.fetch(fetch.key.args()).await;
    if let Some(engine) = engine.upgrade() {
        engine.complete_fetch(fetch, &result);
    }
    result
}

/// Stale-while-revalidate engine over values of type `T`.
pub struct SwrEngine<T> {
    pub(crate) inner: Arc<EngineInner<T>>,
}

impl<T> Clone for SwrEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: CacheValue> Default for SwrEngine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CacheValue> SwrEngine<T> {
    /// Engine with default config on a headless host.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> EngineBuilder<T> {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &SwrConfig {
        &self.inner.config
    }

    pub fn serializer(&self) -> &KeySerializer {
        &self.inner.keys
    }

    pub fn serialize(&self, key: &Key) -> CacheKey {
        self.inner.keys.serialize(key)
    }

    pub fn store(&self) -> &CacheStore<T> {
        &self.inner.store
    }

    pub fn registry(&self) -> &SubscriberRegistry<T> {
        &self.inner.registry
    }

    /// Cached record for `key`. `None` for inactive or never-written keys.
    pub fn get(&self, key: &Key) -> Option<StateRecord<T>> {
        let key = self.serialize(key);
        self.inner.store.get(key.serialized()?)
    }

    /// Cached data, falling back to the engine's fallback map.
    pub fn get_data(&self, key: &Key) -> Option<T> {
        let key = self.serialize(key);
        let serialized = key.serialized()?;
        self.inner
            .store
            .get(serialized)
            .and_then(|r| r.data)
            .or_else(|| self.inner.fallback_for(serialized))
    }

    /// Fetch `key` with `fetcher`. Returns `None` for an inactive key.
    pub fn revalidate(
        &self,
        key: &Key,
        fetcher: SharedFetcher<T>,
        options: RevalidateOptions,
    ) -> Option<FetchHandle<T>> {
        let CacheKey::Active(active) = self.serialize(key) else {
            trace!("Revalidate on inactive key ignored");
            return None;
        };
        Some(self.inner.revalidate_active(&active, fetcher, options))
    }

    /// Warm the cache ahead of any subscriber. Subscribers mounting within
    /// the dedupe window join this fetch.
    pub fn preload(&self, key: &Key, fetcher: SharedFetcher<T>) -> Option<FetchHandle<T>> {
        self.revalidate(key, fetcher, RevalidateOptions::deduped())
    }

    /// Remove the cached record for `key`.
    pub fn delete(&self, key: &Key) -> bool {
        match self.serialize(key).serialized() {
            Some(serialized) => self.inner.store.delete(serialized),
            None => false,
        }
    }

    /// Feed a host event through the revalidation triggers.
    pub fn dispatch(&self, event: HostEvent) {
        triggers::dispatch(&self.inner, event);
    }

    /// A child engine whose cache reads fall through to this one.
    ///
    /// The child has its own subscribers and in-flight table, writes only to
    /// its own backend and shares this engine's key identities and host.
    pub fn scoped(&self, config: SwrConfig) -> Self {
        self.scoped_with(config, Arc::new(InMemoryBackend::new()))
    }

    pub fn scoped_with(&self, config: SwrConfig, backend: Arc<dyn CacheBackend<T>>) -> Self {
        let registry = Arc::new(SubscriberRegistry::new());
        let store = Arc::new(CacheStore::child(
            &self.inner.store,
            backend,
            Arc::clone(&registry),
        ));
        let inner = Arc::new(EngineInner {
            config: Arc::new(config),
            host: Arc::clone(&self.inner.host),
            keys: self.inner.keys.clone(),
            store,
            registry,
            coordinator: RequestCoordinator::new(),
            fallback: self.inner.fallback.clone(),
        });
        triggers::listen(&inner);
        Self { inner }
    }
}

/// Builder for [`SwrEngine`].
pub struct EngineBuilder<T> {
    config: SwrConfig,
    host: Arc<dyn Host>,
    backend: Option<Arc<dyn CacheBackend<T>>>,
    keys: KeySerializer,
    fallback: HashMap<String, T>,
    compare: Option<CompareFn<T>>,
}

impl<T: CacheValue> Default for EngineBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CacheValue> EngineBuilder<T> {
    pub fn new() -> Self {
        Self {
            config: SwrConfig::default(),
            host: Arc::new(HeadlessHost),
            backend: None,
            keys: KeySerializer::new(),
            fallback: HashMap::new(),
            compare: None,
        }
    }

    pub fn config(mut self, config: SwrConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: Arc<dyn Host>) -> Self {
        self.host = host;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn CacheBackend<T>>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Value shown for `key` while nothing is cached. Never written to the
    /// cache. Inactive keys are ignored.
    pub fn fallback(mut self, key: impl Into<Key>, value: T) -> Self {
        if let CacheKey::Active(active) = self.keys.serialize(&key.into()) {
            self.fallback.insert(active.serialized().to_string(), value);
        }
        self
    }

    /// Equality deciding whether fetched data differs from the cached data.
    pub fn compare<F>(mut self, compare: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.compare = Some(Arc::new(compare));
        self
    }

    /// Build the engine. When called inside a tokio runtime this also
    /// starts listening to the host's events.
    pub fn build(self) -> SwrEngine<T> {
        let registry = Arc::new(SubscriberRegistry::new());
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(InMemoryBackend::new()));
        let compare = self
            .compare
            .unwrap_or_else(|| Arc::new(|a: &T, b: &T| a == b));
        let store = Arc::new(CacheStore::new(backend, Arc::clone(&registry), compare));

        let inner = Arc::new(EngineInner {
            config: Arc::new(self.config),
            host: self.host,
            keys: self.keys,
            store,
            registry,
            coordinator: RequestCoordinator::new(),
            fallback: self.fallback,
        });
        triggers::listen(&inner);
        SwrEngine { inner }
    }
}
