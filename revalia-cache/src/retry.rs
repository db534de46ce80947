//! Retry Controller: exponential backoff for failed fetches.
//!
//! Attempts are zero-based: the first retry waits the base interval, each
//! later one doubles it up to the cap. Jitter adds a random amount below the
//! base interval. A scheduled retry is abandoned when the key was
//! superseded, or when the key had subscribers at failure time and has none
//! left when the timer fires.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use revalia_core::{ActiveKey, FetchError, Generation, SharedFetcher, StatePatch, SwrConfig};
use tracing::debug;

use crate::engine::{spawn_detached, EngineInner, RevalidateOptions};
use crate::CacheValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    enabled: bool,
    base: Duration,
    max: Duration,
    max_attempts: Option<u32>,
    jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &SwrConfig) -> Self {
        Self {
            enabled: config.should_retry_on_error,
            base: config.error_retry_interval(),
            max: config.error_retry_max_interval(),
            max_attempts: config.error_retry_count,
            jitter: config.error_retry_jitter,
        }
    }

    /// Whether retry number `attempt` may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Backoff before retry `attempt`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(31);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Backoff plus jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let base_ms = self.base.as_millis() as u64;
        if !self.jitter || base_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::rng().random_range(0..base_ms))
    }
}

/// A retry waiting for its timer.
pub(crate) struct RetryTask<T> {
    pub key: ActiveKey,
    pub fetcher: SharedFetcher<T>,
    pub config: Arc<SwrConfig>,
    pub failed: Generation,
    pub attempt: u32,
    pub error: FetchError,
    /// Whether the key had subscribers when the fetch failed.
    pub watched: bool,
}

pub(crate) fn schedule<T: CacheValue>(engine: &Arc<EngineInner<T>>, task: RetryTask<T>) {
    let delay = RetryPolicy::from_config(&task.config).delay(task.attempt);
    debug!(
        key = %task.key,
        attempt = task.attempt,
        delay_ms = delay.as_millis() as u64,
        error = %task.error,
        "Scheduling retry"
    );

    let weak = Arc::downgrade(engine);
    spawn_detached(async move {
        tokio::time::sleep(delay).await;
        if let Some(engine) = weak.upgrade() {
            fire(&engine, task);
        }
    });
}

fn fire<T: CacheValue>(engine: &Arc<EngineInner<T>>, task: RetryTask<T>) {
    let key = task.key.serialized();

    if engine.coordinator.is_superseded(key, task.failed) {
        debug!(key = %key, attempt = task.attempt, "Retry superseded");
        if engine.coordinator.cancel_retry(key, task.failed) && engine.coordinator.idle(key) {
            engine.store.set(key, StatePatch::new().settled());
            engine.resolve_waiter(key, engine.coordinator.take_waiter(key), None);
        }
        return;
    }

    if task.watched && engine.registry.count(key) == 0 {
        debug!(key = %key, attempt = task.attempt, "Retry abandoned, no subscribers");
        engine.coordinator.cancel_retry(key, task.failed);
        let current = engine.coordinator.is_current(key, task.failed);
        if current {
            engine
                .store
                .set(key, StatePatch::new().error(task.error.clone()).settled());
        }
        let waiter = engine.coordinator.take_idle_waiter(key);
        engine.resolve_waiter(key, waiter, current.then_some(&Err(task.error)));
        return;
    }

    engine.revalidate_active(
        &task.key,
        task.fetcher,
        RevalidateOptions {
            dedupe: false,
            config: Some(task.config),
            attempt: task.attempt + 1,
        },
    );
}
