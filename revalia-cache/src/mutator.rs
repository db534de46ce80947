//! Mutator: local writes with optimistic data and rollback.
//!
//! A mutation opens a mutation window with a fresh generation, optionally
//! shows optimistic data, resolves its value and then either populates the
//! cache or rolls back. The rollback target is the record seen when the
//! window opened, shared by every mutation stacked inside it. Only the latest mutation
//! of a key may touch the cache once resolved; fetches overlapping the
//! window are discarded by the coordinator.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{ready, BoxFuture, FutureExt};
use revalia_core::{
    CacheKey, FetchError, Generation, Key, MutationError, StatePatch, StateRecord,
};
use tracing::{debug, trace};

use crate::engine::{EngineInner, SwrEngine};
use crate::triggers::Trigger;
use crate::CacheValue;

/// What to write.
pub enum Mutation<T> {
    /// Write nothing; only revalidate.
    Revalidate,
    /// Write this value.
    Value(T),
    /// Compute the new value from the current data.
    Update(Box<dyn FnOnce(Option<T>) -> T + Send>),
    /// Await the new value.
    Future(BoxFuture<'static, Result<T, FetchError>>),
}

impl<T> Mutation<T> {
    pub fn update<F>(f: F) -> Self
    where
        F: FnOnce(Option<T>) -> T + Send + 'static,
    {
        Self::Update(Box::new(f))
    }

    pub fn future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        Self::Future(fut.boxed())
    }
}

impl<T> fmt::Debug for Mutation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Revalidate => "Revalidate",
            Self::Value(_) => "Value",
            Self::Update(_) => "Update",
            Self::Future(_) => "Future",
        };
        f.write_str(kind)
    }
}

/// Data shown while the mutation resolves.
pub enum OptimisticData<T> {
    Value(T),
    Compute(Box<dyn FnOnce(Option<&T>) -> T + Send>),
}

impl<T> OptimisticData<T> {
    fn resolve(self, committed: Option<&T>) -> T {
        match self {
            Self::Value(value) => value,
            Self::Compute(f) => f(committed),
        }
    }
}

/// When a failed mutation restores its snapshot.
#[derive(Clone)]
pub enum Rollback {
    Always,
    Never,
    When(Arc<dyn Fn(&FetchError) -> bool + Send + Sync>),
}

impl Rollback {
    fn applies(&self, error: &FetchError) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::When(predicate) => predicate(error),
        }
    }
}

/// Whether and how the resolved value is written.
pub enum PopulateCache<T> {
    Yes,
    No,
    /// Combine the resolved value with the current data.
    Transform(Box<dyn FnOnce(T, Option<T>) -> T + Send>),
}

pub struct MutateOptions<T> {
    pub optimistic_data: Option<OptimisticData<T>>,
    pub rollback_on_error: Rollback,
    pub populate_cache: PopulateCache<T>,
    pub revalidate: bool,
    pub throw_on_error: bool,
}

impl<T> Default for MutateOptions<T> {
    fn default() -> Self {
        Self {
            optimistic_data: None,
            rollback_on_error: Rollback::Always,
            populate_cache: PopulateCache::Yes,
            revalidate: true,
            throw_on_error: true,
        }
    }
}

impl<T> MutateOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn optimistic(mut self, value: T) -> Self {
        self.optimistic_data = Some(OptimisticData::Value(value));
        self
    }

    pub fn optimistic_with<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Option<&T>) -> T + Send + 'static,
    {
        self.optimistic_data = Some(OptimisticData::Compute(Box::new(f)));
        self
    }

    pub fn rollback(mut self, rollback: Rollback) -> Self {
        self.rollback_on_error = rollback;
        self
    }

    pub fn rollback_when<F>(self, predicate: F) -> Self
    where
        F: Fn(&FetchError) -> bool + Send + Sync + 'static,
    {
        self.rollback(Rollback::When(Arc::new(predicate)))
    }

    pub fn populate(mut self, populate: PopulateCache<T>) -> Self {
        self.populate_cache = populate;
        self
    }

    pub fn populate_with<F>(self, f: F) -> Self
    where
        F: FnOnce(T, Option<T>) -> T + Send + 'static,
    {
        self.populate(PopulateCache::Transform(Box::new(f)))
    }

    pub fn revalidate(mut self, revalidate: bool) -> Self {
        self.revalidate = revalidate;
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = throw;
        self
    }
}

/// State captured when a mutation starts.
struct MutationContext<T> {
    generation: Generation,
    snapshot: Option<StateRecord<T>>,
    optimistic_applied: bool,
}

pub(crate) async fn run<T: CacheValue>(
    engine: &Arc<EngineInner<T>>,
    key: &str,
    mutation: Mutation<T>,
    options: MutateOptions<T>,
) -> Result<Option<T>, MutationError> {
    let MutateOptions {
        optimistic_data,
        rollback_on_error,
        populate_cache,
        revalidate,
        throw_on_error,
    } = options;

    let visible = engine.store.get(key);
    let committed = visible.as_ref().and_then(|r| r.data.clone());
    let kind = format!("{mutation:?}");
    let resolve: BoxFuture<'static, Result<T, FetchError>> = match mutation {
        Mutation::Revalidate => {
            if revalidate {
                reconcile(engine, key);
            }
            return Ok(committed);
        }
        Mutation::Value(value) => ready(Ok(value)).boxed(),
        Mutation::Update(update) => ready(Ok(update(committed.clone()))).boxed(),
        Mutation::Future(fut) => fut,
    };

    let (generation, snapshot) = engine.coordinator.begin_mutation(key, visible);
    debug!(key = %key, generation, kind = %kind, "Mutation started");

    let mut ctx = MutationContext {
        generation,
        snapshot,
        optimistic_applied: false,
    };
    if let Some(optimistic) = optimistic_data {
        let value = optimistic.resolve(committed.as_ref());
        engine
            .store
            .set(key, StatePatch::new().data(value).validating(true));
        ctx.optimistic_applied = true;
    }

    let outcome = resolve.await;

    if !engine.coordinator.end_mutation(key, ctx.generation) {
        debug!(key = %key, generation = ctx.generation, "Mutation superseded");
        return finish(key, outcome, throw_on_error);
    }

    match &outcome {
        Ok(value) => populate(engine, key, value, populate_cache, ctx.optimistic_applied),
        Err(error) => {
            if ctx.optimistic_applied && rollback_on_error.applies(error) {
                debug!(key = %key, error = %error, "Mutation failed, rolling back");
                let busy = engine.coordinator.busy(key);
                engine.store.restore(key, ctx.snapshot.as_ref(), busy);
            } else if ctx.optimistic_applied {
                engine.store.set(key, settle_flags(engine, key, StatePatch::new()));
            }
        }
    }

    if revalidate {
        reconcile(engine, key);
    }
    engine.resolve_waiter(key, engine.coordinator.take_idle_waiter(key), None);
    finish(key, outcome, throw_on_error)
}

fn populate<T: CacheValue>(
    engine: &Arc<EngineInner<T>>,
    key: &str,
    value: &T,
    populate_cache: PopulateCache<T>,
    optimistic_applied: bool,
) {
    let data = match populate_cache {
        PopulateCache::Yes => value.clone(),
        PopulateCache::Transform(transform) => {
            let current = engine.store.get(key).and_then(|r| r.data);
            transform(value.clone(), current)
        }
        PopulateCache::No => {
            if optimistic_applied {
                engine.store.set(key, settle_flags(engine, key, StatePatch::new()));
            }
            return;
        }
    };
    let patch = StatePatch::new().data(data).clear_error();
    engine.store.set(key, settle_flags(engine, key, patch));
}

/// Clear loading; keep validating while a fetch or retry is still running.
fn settle_flags<T: CacheValue>(
    engine: &EngineInner<T>,
    key: &str,
    patch: StatePatch<T>,
) -> StatePatch<T> {
    patch
        .validating(engine.coordinator.busy(key))
        .loading(false)
}

/// Drop any in-flight entry and refetch through the key's first bound
/// subscriber.
fn reconcile<T: CacheValue>(engine: &Arc<EngineInner<T>>, key: &str) {
    engine.coordinator.forget_in_flight(key);
    if engine.revalidate_bound(key, false).is_some() {
        trace!(key = %key, trigger = %Trigger::Mutation, "Revalidation triggered");
    } else {
        trace!(key = %key, "No bound subscriber to revalidate through");
    }
}

fn finish<T>(
    key: &str,
    outcome: Result<T, FetchError>,
    throw_on_error: bool,
) -> Result<Option<T>, MutationError> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(source) if throw_on_error => Err(MutationError::Rejected {
            key: key.to_string(),
            source,
        }),
        Err(_) => Ok(None),
    }
}

impl<T: CacheValue> SwrEngine<T> {
    /// Write `mutation` to `key`. Inactive keys resolve to `Ok(None)`.
    ///
    /// Returns the resolved value. A rejected mutation returns
    /// [`MutationError::Rejected`] unless `throw_on_error` is off, in which
    /// case it returns `Ok(None)`.
    pub async fn mutate(
        &self,
        key: &Key,
        mutation: Mutation<T>,
        options: MutateOptions<T>,
    ) -> Result<Option<T>, MutationError> {
        let CacheKey::Active(active) = self.serialize(key) else {
            return Ok(None);
        };
        run(&self.inner, active.serialized(), mutation, options).await
    }

    /// Mutate every cached key whose serialized form matches `predicate`.
    /// Keys are processed one after another.
    pub async fn mutate_matching<P, F>(
        &self,
        predicate: P,
        mut build: F,
    ) -> Vec<(String, Result<Option<T>, MutationError>)>
    where
        P: Fn(&str) -> bool,
        F: FnMut(&str) -> (Mutation<T>, MutateOptions<T>),
    {
        let mut keys: Vec<String> = self
            .inner
            .store
            .keys()
            .into_iter()
            .filter(|k| predicate(k))
            .collect();
        keys.sort();

        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let (mutation, options) = build(&key);
            let result = run(&self.inner, &key, mutation, options).await;
            results.push((key, result));
        }
        results
    }
}
