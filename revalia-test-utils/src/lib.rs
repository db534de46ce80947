//! Revalia Test Utilities
//!
//! Shared test infrastructure for the Revalia workspace:
//! - A host whose visibility and connectivity tests control
//! - Scripted and gated fetchers
//! - An observer that records every notification
//! - Proptest generators for keys
//! - Assertions over recorded states

pub use revalia_core::{
    fetcher_fn, ActiveKey, CacheKey, FetchError, Fetcher, Host, HostEvent, HostEventSender, Key,
    KeyArg, KeySerializer, ObjectRef, SharedFetcher, StateObserver, StateRecord, SwrConfig,
};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Install a test tracing subscriber honoring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let spawned tasks run. Under a paused clock this also advances time by
/// one millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ============================================================================
// MANUAL HOST
// ============================================================================

/// Host whose state is flipped by the test. Every change is delivered to
/// the engines subscribed to it.
pub struct ManualHost {
    visible: AtomicBool,
    focused: AtomicBool,
    online: AtomicBool,
    sinks: Mutex<Vec<HostEventSender>>,
}

impl Default for ManualHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualHost {
    pub fn new() -> Self {
        Self {
            visible: AtomicBool::new(true),
            focused: AtomicBool::new(true),
            online: AtomicBool::new(true),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn hidden() -> Self {
        let host = Self::new();
        host.visible.store(false, Ordering::SeqCst);
        host.focused.store(false, Ordering::SeqCst);
        host
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
        self.emit(HostEvent::VisibilityChange);
    }

    pub fn focus(&self) {
        self.focused.store(true, Ordering::SeqCst);
        self.visible.store(true, Ordering::SeqCst);
        self.emit(HostEvent::Focus);
    }

    pub fn blur(&self) {
        self.focused.store(false, Ordering::SeqCst);
    }

    pub fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.emit(HostEvent::Offline);
    }

    pub fn go_online(&self) {
        self.online.store(true, Ordering::SeqCst);
        self.emit(HostEvent::Reconnect);
    }

    /// Number of live event sinks.
    pub fn listeners(&self) -> usize {
        let mut sinks = lock(&self.sinks);
        sinks.retain(|s| !s.is_closed());
        sinks.len()
    }

    fn emit(&self, event: HostEvent) {
        lock(&self.sinks).retain(|sink| sink.send(event).is_ok());
    }
}

impl Host for ManualHost {
    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    fn has_focus(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn subscribe(&self, events: HostEventSender) {
        lock(&self.sinks).push(events);
    }
}

// ============================================================================
// FETCHERS
// ============================================================================

/// Fetcher answering from a script. Each call takes the next response; the
/// last one repeats once the script runs out.
pub struct ScriptedFetcher<T> {
    script: Mutex<VecDeque<Result<T, FetchError>>>,
    last: Mutex<Option<Result<T, FetchError>>>,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<KeyArg>>>,
}

impl<T: Clone + Send + Sync + 'static> ScriptedFetcher<T> {
    pub fn new<I>(responses: I) -> Arc<Self>
    where
        I: IntoIterator<Item = Result<T, FetchError>>,
    {
        Self::with_delay(responses, Duration::ZERO)
    }

    /// Every call sleeps `delay` before answering.
    pub fn with_delay<I>(responses: I, delay: Duration) -> Arc<Self>
    where
        I: IntoIterator<Item = Result<T, FetchError>>,
    {
        Arc::new(Self {
            script: Mutex::new(responses.into_iter().collect()),
            last: Mutex::new(None),
            delay,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Always answer `value`.
    pub fn always(value: T) -> Arc<Self> {
        Self::new([Ok(value)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Arguments of every call so far.
    pub fn seen_args(&self) -> Vec<Vec<KeyArg>> {
        lock(&self.seen).clone()
    }

    /// This fetcher as the engine's shared handle.
    pub fn shared(self: &Arc<Self>) -> SharedFetcher<T> {
        Arc::clone(self) as SharedFetcher<T>
    }

    fn next_response(&self) -> Result<T, FetchError> {
        let next = lock(&self.script).pop_front();
        let mut last = lock(&self.last);
        match next {
            Some(response) => {
                *last = Some(response.clone());
                response
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(FetchError::msg("script exhausted"))),
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Fetcher<T> for ScriptedFetcher<T> {
    async fn fetch(&self, args: &[KeyArg]) -> Result<T, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.seen).push(args.to_vec());
        let response = self.next_response();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        response
    }
}

/// Fetcher whose calls each wait until the test releases them, in any
/// order.
pub struct GatedFetcher<T> {
    gates: Mutex<Vec<Option<oneshot::Sender<Result<T, FetchError>>>>>,
}

impl<T: Send + 'static> GatedFetcher<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gates: Mutex::new(Vec::new()),
        })
    }

    pub fn shared(self: &Arc<Self>) -> SharedFetcher<T> {
        Arc::clone(self) as SharedFetcher<T>
    }

    /// Number of calls started so far.
    pub fn calls(&self) -> usize {
        lock(&self.gates).len()
    }

    /// Resolve call `index` (zero-based, in call order). Returns `false` if
    /// the call does not exist or was already released.
    pub fn release(&self, index: usize, response: Result<T, FetchError>) -> bool {
        let sender = lock(&self.gates).get_mut(index).and_then(Option::take);
        match sender {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Fetcher<T> for GatedFetcher<T> {
    async fn fetch(&self, _args: &[KeyArg]) -> Result<T, FetchError> {
        let (tx, rx) = oneshot::channel();
        lock(&self.gates).push(Some(tx));
        rx.await
            .unwrap_or_else(|_| Err(FetchError::msg("gate dropped")))
    }
}

// ============================================================================
// OBSERVERS
// ============================================================================

/// Observer keeping every record it was notified with.
pub struct RecordingObserver<T> {
    states: Mutex<Vec<(String, StateRecord<T>)>>,
}

impl<T: Clone + Send + Sync + 'static> RecordingObserver<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(Vec::new()),
        })
    }

    pub fn observer(self: &Arc<Self>) -> Arc<dyn StateObserver<T>> {
        Arc::clone(self) as Arc<dyn StateObserver<T>>
    }

    pub fn states(&self) -> Vec<StateRecord<T>> {
        lock(&self.states).iter().map(|(_, s)| s.clone()).collect()
    }

    /// Data of every notification, in order.
    pub fn data_history(&self) -> Vec<Option<T>> {
        lock(&self.states).iter().map(|(_, s)| s.data.clone()).collect()
    }

    pub fn last(&self) -> Option<StateRecord<T>> {
        lock(&self.states).last().map(|(_, s)| s.clone())
    }

    pub fn count(&self) -> usize {
        lock(&self.states).len()
    }

    pub fn clear(&self) {
        lock(&self.states).clear();
    }
}

impl<T: Clone + Send + Sync> StateObserver<T> for RecordingObserver<T> {
    fn on_state_change(&self, key: &str, state: &StateRecord<T>) {
        lock(&self.states).push((key.to_string(), state.clone()));
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys.

    use super::*;
    use proptest::prelude::*;

    /// Scalar key arguments, excluding floats (NaN never equals itself).
    pub fn arb_scalar_arg() -> impl Strategy<Value = KeyArg> {
        prop_oneof![
            Just(KeyArg::Null),
            any::<bool>().prop_map(KeyArg::Bool),
            any::<i64>().prop_map(KeyArg::Int),
            "[a-z/_0-9]{0,12}".prop_map(KeyArg::Str),
        ]
    }

    /// Arguments nested up to three levels deep.
    pub fn arb_key_arg() -> impl Strategy<Value = KeyArg> {
        arb_scalar_arg().prop_recursive(3, 24, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(KeyArg::List)
        })
    }

    /// Non-empty string keys.
    pub fn arb_string_key() -> impl Strategy<Value = String> {
        "/[a-z]{1,8}(/[a-z0-9]{1,6}){0,3}"
    }

    /// Active list keys.
    pub fn arb_list_key() -> impl Strategy<Value = Vec<KeyArg>> {
        prop::collection::vec(arb_key_arg(), 1..5)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over recorded state sequences.

    use super::*;

    /// Timestamps never decrease across a notification sequence.
    pub fn assert_timestamps_monotonic<T>(states: &[StateRecord<T>]) {
        for pair in states.windows(2) {
            assert!(
                pair[0].timestamp <= pair[1].timestamp,
                "timestamp went back from {} to {}",
                pair[0].timestamp,
                pair[1].timestamp
            );
        }
    }

    /// The record carries data and no in-progress flags.
    pub fn assert_settled_with<T: PartialEq + std::fmt::Debug>(state: &StateRecord<T>, data: &T) {
        assert_eq!(state.data.as_ref(), Some(data));
        assert!(!state.is_validating, "still validating");
        assert!(!state.is_loading, "still loading");
    }
}

// ============================================================================
// TESTS
// ============================================================================
