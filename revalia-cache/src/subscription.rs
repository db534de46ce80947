//! Subscriptions: one consumer watching one (changeable) key.
//!
//! A [`Subscription`] registers its observer with the registry, revalidates
//! on attach when the mount rule says so, runs its refresh loop and falls
//! back to placeholder data while nothing is cached. Dropping it detaches
//! everything.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use revalia_core::{
    CacheKey, Key, MutationError, SharedFetcher, StateObserver, StateRecord, SwrConfig,
};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::engine::{EngineInner, RevalidateOptions, SwrEngine};
use crate::handle::FetchHandle;
use crate::mutator::{self, MutateOptions, Mutation};
use crate::registry::{Binding, Subscriber};
use crate::triggers::{self, RefreshIntervalFn, Trigger};
use crate::CacheValue;

/// Per-subscription options.
pub struct SubscribeOptions<T> {
    /// Replaces the engine config for this subscription.
    pub config: Option<SwrConfig>,
    /// Shown while nothing is cached. Never written to the cache.
    pub fallback_data: Option<T>,
    /// Refresh period computed from the latest data. Overrides
    /// `refresh_interval_ms`.
    pub refresh_interval: Option<RefreshIntervalFn<T>>,
}

impl<T> Default for SubscribeOptions<T> {
    fn default() -> Self {
        Self {
            config: None,
            fallback_data: None,
            refresh_interval: None,
        }
    }
}

impl<T> SubscribeOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SwrConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn fallback_data(mut self, data: T) -> Self {
        self.fallback_data = Some(data);
        self
    }

    pub fn refresh_interval_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&T>) -> Duration + Send + Sync + 'static,
    {
        self.refresh_interval = Some(Arc::new(f));
        self
    }
}

struct Attachment<T> {
    key: CacheKey,
    subscriber: Option<Arc<Subscriber<T>>>,
    refresh_task: Option<JoinHandle<()>>,
    previous_data: Option<T>,
}

pub struct Subscription<T: CacheValue> {
    engine: Arc<EngineInner<T>>,
    observer: Arc<dyn StateObserver<T>>,
    fetcher: Option<SharedFetcher<T>>,
    config: Arc<SwrConfig>,
    fallback_data: Option<T>,
    refresh_interval: Option<RefreshIntervalFn<T>>,
    attachment: Mutex<Attachment<T>>,
}

impl<T: CacheValue> Subscription<T> {
    fn new(
        engine: Arc<EngineInner<T>>,
        fetcher: Option<SharedFetcher<T>>,
        observer: Arc<dyn StateObserver<T>>,
        options: SubscribeOptions<T>,
    ) -> Self {
        let config = options
            .config
            .map(Arc::new)
            .unwrap_or_else(|| Arc::clone(&engine.config));
        Self {
            engine,
            observer,
            fetcher,
            config,
            fallback_data: options.fallback_data,
            refresh_interval: options.refresh_interval,
            attachment: Mutex::new(Attachment {
                key: CacheKey::Inactive,
                subscriber: None,
                refresh_task: None,
                previous_data: None,
            }),
        }
    }

    /// The key currently watched.
    pub fn key(&self) -> CacheKey {
        self.lock().key.clone()
    }

    /// Switch to another key. The old key is released first; with
    /// `keep_previous_data`, its data stays visible until the new key has
    /// some.
    pub fn set_key(&self, key: &Key) {
        let next = self.engine.keys.serialize(key);
        let pending = {
            let mut attachment = self.lock();
            if attachment.key == next {
                return;
            }
            if self.config.keep_previous_data {
                let shown = self.resolve(&attachment).data;
                if shown.is_some() {
                    attachment.previous_data = shown;
                }
            }
            self.detach(&mut attachment);
            self.attach(&mut attachment, next, false)
        };
        if let Some(binding) = pending {
            triggers::soft_revalidate(&self.engine, &binding, Trigger::KeyChange);
        }
    }

    /// State to display: the cached record with the fallback chain applied
    /// to missing data (`fallback_data`, the engine's fallback map, then the
    /// previous key's data when `keep_previous_data` is on).
    pub fn snapshot(&self) -> StateRecord<T> {
        let attachment = self.lock();
        self.resolve(&attachment)
    }

    pub fn data(&self) -> Option<T> {
        self.snapshot().data
    }

    /// Start a fresh fetch for the current key.
    pub fn revalidate(&self) -> Option<FetchHandle<T>> {
        let key = self.key();
        let active = key.as_active()?;
        let fetcher = self.fetcher.clone()?;
        Some(self.engine.revalidate_active(
            active,
            fetcher,
            RevalidateOptions {
                dedupe: false,
                config: Some(Arc::clone(&self.config)),
                attempt: 0,
            },
        ))
    }

    /// Mutate the current key.
    pub async fn mutate(
        &self,
        mutation: Mutation<T>,
        options: MutateOptions<T>,
    ) -> Result<Option<T>, MutationError> {
        let key = self.key();
        match key.serialized() {
            Some(serialized) => mutator::run(&self.engine, serialized, mutation, options).await,
            None => Ok(None),
        }
    }

    pub fn unsubscribe(self) {}

    fn resolve(&self, attachment: &Attachment<T>) -> StateRecord<T> {
        let Some(key) = attachment.key.serialized() else {
            return StateRecord {
                data: self.previous_if_kept(attachment),
                ..Default::default()
            };
        };
        let mut record = self.engine.store.get_or_default(key);
        if record.data.is_none() {
            record.data = self
                .fallback_data
                .clone()
                .or_else(|| self.engine.fallback_for(key))
                .or_else(|| self.previous_if_kept(attachment));
        }
        record
    }

    fn previous_if_kept(&self, attachment: &Attachment<T>) -> Option<T> {
        if self.config.keep_previous_data {
            attachment.previous_data.clone()
        } else {
            None
        }
    }

    /// Register for `key`. Returns the binding to revalidate through when
    /// the mount rule asks for a fetch; the caller runs it after releasing
    /// the attachment lock.
    fn attach(
        &self,
        attachment: &mut Attachment<T>,
        key: CacheKey,
        initial: bool,
    ) -> Option<Binding<T>> {
        attachment.key = key.clone();
        let CacheKey::Active(active) = key else {
            trace!("Subscription on inactive key");
            return None;
        };

        let binding = self.fetcher.as_ref().map(|fetcher| Binding {
            key: active.clone(),
            fetcher: Arc::clone(fetcher),
            config: Arc::clone(&self.config),
        });
        let (subscriber, count) = self.engine.registry.subscribe(
            active.serialized(),
            Arc::clone(&self.observer),
            binding.clone(),
        );
        debug!(key = %active, subscribers = count, "Subscriber attached");
        attachment.subscriber = Some(subscriber);

        let binding = binding?;
        attachment.refresh_task = triggers::start_refresh(
            &self.engine,
            binding.clone(),
            self.refresh_interval.clone(),
        );

        if self.should_revalidate(active.serialized(), initial) {
            Some(binding)
        } else {
            None
        }
    }

    fn detach(&self, attachment: &mut Attachment<T>) {
        if let Some(task) = attachment.refresh_task.take() {
            task.abort();
        }
        if let (Some(subscriber), Some(key)) =
            (attachment.subscriber.take(), attachment.key.serialized())
        {
            let remaining = self.engine.registry.unsubscribe(key, subscriber.id());
            debug!(key = %key, subscribers = remaining, "Subscriber detached");
        }
    }

    /// `revalidate_on_mount` decides the first attach when set. Otherwise a
    /// key without data is always fetched and one with data only when
    /// `revalidate_if_stale` is on.
    fn should_revalidate(&self, key: &str, initial: bool) -> bool {
        if initial {
            if let Some(on_mount) = self.config.revalidate_on_mount {
                return on_mount;
            }
        }
        let has_data = self
            .engine
            .store
            .get(key)
            .is_some_and(|r| r.has_data())
            || self.fallback_data.is_some()
            || self.engine.fallback.contains_key(key);
        !has_data || self.config.revalidate_if_stale
    }

    fn lock(&self) -> MutexGuard<'_, Attachment<T>> {
        self.attachment.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: CacheValue> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut attachment = self.lock();
        self.detach(&mut attachment);
    }
}

impl<T: CacheValue> SwrEngine<T> {
    /// Watch `key`, fetching with `fetcher` under the engine config.
    pub fn subscribe(
        &self,
        key: &Key,
        fetcher: SharedFetcher<T>,
        observer: Arc<dyn StateObserver<T>>,
    ) -> Subscription<T> {
        self.subscribe_with(key, Some(fetcher), observer, SubscribeOptions::new())
    }

    /// Watch `key` without ever fetching it.
    pub fn watch(&self, key: &Key, observer: Arc<dyn StateObserver<T>>) -> Subscription<T> {
        self.subscribe_with(key, None, observer, SubscribeOptions::new())
    }

    pub fn subscribe_with(
        &self,
        key: &Key,
        fetcher: Option<SharedFetcher<T>>,
        observer: Arc<dyn StateObserver<T>>,
        options: SubscribeOptions<T>,
    ) -> Subscription<T> {
        let subscription = Subscription::new(Arc::clone(&self.inner), fetcher, observer, options);
        let key = self.inner.keys.serialize(key);
        let pending = {
            let mut attachment = subscription.lock();
            subscription.attach(&mut attachment, key, true)
        };
        if let Some(binding) = pending {
            triggers::soft_revalidate(&self.inner, &binding, Trigger::Mount);
        }
        subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use revalia_core::{fetcher_fn, KeyArg};

    fn noop() -> Arc<dyn StateObserver<String>> {
        Arc::new(|_: &str, _: &StateRecord<String>| {})
    }

    fn echo(calls: Arc<AtomicUsize>) -> SharedFetcher<String> {
        fetcher_fn(move |args: Vec<KeyArg>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                match &args[0] {
                    KeyArg::Str(s) => Ok(format!("data:{s}")),
                    other => Ok(format!("data:{other:?}")),
                }
            }
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_fetches_missing_data() {
        let engine = SwrEngine::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = engine.subscribe(&Key::from("a"), echo(calls.clone()), noop());
        settle().await;

        assert_eq!(sub.data().as_deref(), Some("data:a"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.registry().count("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_skips_cached_when_not_if_stale() {
        let engine = SwrEngine::<String>::builder()
            .config(SwrConfig::default().with_revalidate_if_stale(false))
            .build();
        engine
            .mutate(&Key::from("a"), Mutation::Value("cached".into()), MutateOptions::new())
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let sub = engine.subscribe(&Key::from("a"), echo(calls.clone()), noop());
        settle().await;
        assert_eq!(sub.data().as_deref(), Some("cached"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revalidate_on_mount_overrides() {
        let engine = SwrEngine::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = engine.subscribe_with(
            &Key::from("a"),
            Some(echo(calls.clone())),
            noop(),
            SubscribeOptions::new().config(SwrConfig::default().with_revalidate_on_mount(Some(false))),
        );
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_data_counts_as_data() {
        let engine = SwrEngine::<String>::builder()
            .config(SwrConfig::default().with_revalidate_if_stale(false))
            .build();
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = engine.subscribe_with(
            &Key::from("a"),
            Some(echo(calls.clone())),
            noop(),
            SubscribeOptions::new().fallback_data("placeholder".to_string()),
        );
        settle().await;
        assert_eq!(sub.data().as_deref(), Some("placeholder"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(engine.get(&Key::from("a")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_unsubscribes() {
        let engine = SwrEngine::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = engine.subscribe(&Key::from("a"), echo(calls), noop());
        assert_eq!(engine.registry().count("a"), 1);
        sub.unsubscribe();
        assert_eq!(engine.registry().count("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_key_moves_registration() {
        let engine = SwrEngine::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = engine.subscribe(&Key::from("a"), echo(calls.clone()), noop());
        settle().await;

        sub.set_key(&Key::from("b"));
        settle().await;
        assert_eq!(engine.registry().count("a"), 0);
        assert_eq!(engine.registry().count("b"), 1);
        assert_eq!(sub.data().as_deref(), Some("data:b"));

        sub.set_key(&Key::Inactive);
        assert_eq!(engine.registry().count("b"), 0);
        assert!(sub.key().serialized().is_none());
        assert!(sub.data().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_previous_data_across_key_change() {
        let engine = SwrEngine::<String>::builder()
            .config(SwrConfig::default().with_keep_previous_data(true))
            .build();
        let slow = fetcher_fn(|args: Vec<KeyArg>| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(format!("{:?}", args[0]))
        });

        let sub = engine.subscribe(&Key::from("a"), slow, noop());
        tokio::time::sleep(Duration::from_millis(150)).await;
        let first = sub.data();
        assert!(first.is_some());

        sub.set_key(&Key::from("b"));
        assert_eq!(sub.data(), first);
        assert!(sub.snapshot().is_loading);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sub.data().as_deref(), Some("Str(\"b\")"));
    }
}
