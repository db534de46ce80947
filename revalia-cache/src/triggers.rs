//! Revalidation Trigger Set: focus, reconnect and interval revalidation.
//!
//! Host events arrive over an mpsc channel handed to [`Host::subscribe`]
//! when the engine is built; [`dispatch`] fans them out to bound
//! subscribers. Every trigger revalidates with dedupe, so a burst of events
//! collapses into the in-flight fetch.
//!
//! [`Host::subscribe`]: revalia_core::Host::subscribe

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use revalia_core::HostEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::engine::{spawn_detached, EngineInner, RevalidateOptions};
use crate::handle::FetchHandle;
use crate::registry::Binding;
use crate::CacheValue;

/// Computes the refresh period from the latest data. A zero period stops
/// the refresh loop.
pub type RefreshIntervalFn<T> = Arc<dyn Fn(Option<&T>) -> Duration + Send + Sync>;

/// What caused a revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Mount,
    KeyChange,
    Focus,
    Reconnect,
    Interval,
    Mutation,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mount => "mount",
            Self::KeyChange => "key_change",
            Self::Focus => "focus",
            Self::Reconnect => "reconnect",
            Self::Interval => "interval",
            Self::Mutation => "mutation",
        };
        f.write_str(name)
    }
}

/// Subscribe to the engine's host and forward its events to [`dispatch`].
pub(crate) fn listen<T: CacheValue>(engine: &Arc<EngineInner<T>>) {
    if tokio::runtime::Handle::try_current().is_err() {
        debug!("No tokio runtime, host events must be dispatched manually");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.host.subscribe(tx);

    let weak = Arc::downgrade(engine);
    spawn_detached(async move {
        while let Some(event) = rx.recv().await {
            let Some(engine) = weak.upgrade() else {
                break;
            };
            dispatch(&engine, event);
        }
        trace!("Host listener stopped");
    });
}

pub(crate) fn dispatch<T: CacheValue>(engine: &Arc<EngineInner<T>>, event: HostEvent) {
    let host = &engine.host;
    let now = Instant::now();

    match event {
        HostEvent::Focus | HostEvent::VisibilityChange => {
            if !host.is_visible() {
                trace!(?event, "Host hidden, focus revalidation skipped");
                return;
            }
            if event == HostEvent::Focus && !host.has_focus() {
                trace!("Focus event without focus, skipped");
                return;
            }
            for subscriber in engine.registry.bound() {
                let Some(binding) = subscriber.binding() else {
                    continue;
                };
                let config = &binding.config;
                if !config.revalidate_on_focus || !host.is_active() {
                    continue;
                }
                if !subscriber.try_pass_focus(now, config.focus_throttle_interval()) {
                    trace!(key = %binding.key, "Focus revalidation throttled");
                    continue;
                }
                soft_revalidate(engine, binding, Trigger::Focus);
            }
        }
        HostEvent::Reconnect => {
            for subscriber in engine.registry.bound() {
                let Some(binding) = subscriber.binding() else {
                    continue;
                };
                if binding.config.revalidate_on_reconnect && host.is_active() {
                    soft_revalidate(engine, binding, Trigger::Reconnect);
                }
            }
        }
        HostEvent::Offline => debug!("Host went offline"),
    }
}

/// Deduplicated revalidation through a subscriber's binding.
pub(crate) fn soft_revalidate<T: CacheValue>(
    engine: &Arc<EngineInner<T>>,
    binding: &Binding<T>,
    trigger: Trigger,
) -> FetchHandle<T> {
    trace!(key = %binding.key, %trigger, "Revalidation triggered");
    engine.revalidate_active(
        &binding.key,
        Arc::clone(&binding.fetcher),
        RevalidateOptions {
            dedupe: true,
            config: Some(Arc::clone(&binding.config)),
            attempt: 0,
        },
    )
}

/// Start the refresh loop for one subscriber. Returns `None` when polling is
/// disabled.
pub(crate) fn start_refresh<T: CacheValue>(
    engine: &Arc<EngineInner<T>>,
    binding: Binding<T>,
    dynamic: Option<RefreshIntervalFn<T>>,
) -> Option<JoinHandle<()>> {
    if dynamic.is_none() && binding.config.refresh_interval().is_zero() {
        return None;
    }
    spawn_detached(refresh_loop(Arc::downgrade(engine), binding, dynamic))
}

async fn refresh_loop<T: CacheValue>(
    weak: Weak<EngineInner<T>>,
    binding: Binding<T>,
    dynamic: Option<RefreshIntervalFn<T>>,
) {
    loop {
        let Some(period) = next_period(&weak, &binding, dynamic.as_ref()) else {
            return;
        };
        if period.is_zero() {
            trace!(key = %binding.key, "Refresh loop stopped");
            return;
        }

        tokio::time::sleep(period).await;

        let handle = match weak.upgrade() {
            Some(engine) => refresh_tick(&engine, &binding),
            None => return,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn next_period<T: CacheValue>(
    weak: &Weak<EngineInner<T>>,
    binding: &Binding<T>,
    dynamic: Option<&RefreshIntervalFn<T>>,
) -> Option<Duration> {
    let engine = weak.upgrade()?;
    Some(match dynamic {
        Some(period) => {
            let data = engine
                .store
                .get(binding.key.serialized())
                .and_then(|r| r.data);
            period(data.as_ref())
        }
        None => binding.config.refresh_interval(),
    })
}

fn refresh_tick<T: CacheValue>(
    engine: &Arc<EngineInner<T>>,
    binding: &Binding<T>,
) -> Option<FetchHandle<T>> {
    let config = &binding.config;
    let host = &engine.host;
    let state = engine.store.get_or_default(binding.key.serialized());

    if state.has_error() {
        trace!(key = %binding.key, "Refresh skipped, key has an error");
        return None;
    }
    if !config.refresh_when_hidden && !host.is_visible() {
        trace!(key = %binding.key, "Refresh skipped, host hidden");
        return None;
    }
    if !config.refresh_when_offline && !host.is_online() {
        trace!(key = %binding.key, "Refresh skipped, host offline");
        return None;
    }
    Some(soft_revalidate(engine, binding, Trigger::Interval))
}
