//! Request Coordinator: in-flight deduplication and generation bookkeeping.
//!
//! Each key carries one generation counter shared by fetches and mutations.
//! A fetch result may be committed only when:
//!
//! 1. it is still the latest dispatched fetch for the key, and
//! 2. no mutation is pending, and
//! 3. it was dispatched after the last mutation ended.
//!
//! A mutation window also holds the rollback snapshot. Mutations stacked
//! inside one window share the snapshot taken when the window opened, so a
//! rollback never lands on another mutation's optimistic data.
//!
//! The coordinator only keeps the books. Starting fetches and writing
//! results is the engine's job.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use revalia_core::{FetchError, Generation, StateRecord};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::handle::FetchHandle;

struct MutationWindow<T> {
    /// Generation assigned when the mutation settled. `None` while pending.
    ended: Option<Generation>,
    /// Record visible before the window's first mutation.
    snapshot: Option<StateRecord<T>>,
}

/// Blocking readers parked on a retry chain.
struct RetryWaiter<T> {
    handle: FetchHandle<T>,
    tx: oneshot::Sender<Result<T, FetchError>>,
}

struct InFlight<T> {
    generation: Generation,
    started_at: Instant,
    handle: FetchHandle<T>,
}

struct KeyFlight<T> {
    generation: Generation,
    latest_fetch: Generation,
    latest_mutation: Generation,
    mutation: Option<MutationWindow<T>>,
    in_flight: Option<InFlight<T>>,
    /// Failed generation whose retry timer is running.
    retry_pending: Option<Generation>,
    waiter: Option<RetryWaiter<T>>,
}

impl<T> Default for KeyFlight<T> {
    fn default() -> Self {
        Self {
            generation: 0,
            latest_fetch: 0,
            latest_mutation: 0,
            mutation: None,
            in_flight: None,
            retry_pending: None,
            waiter: None,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> KeyFlight<T> {
    fn next_generation(&mut self) -> Generation {
        self.generation += 1;
        self.generation
    }

    fn commit_allowed(&self, generation: Generation) -> bool {
        if generation != self.latest_fetch {
            return false;
        }
        match &self.mutation {
            None => true,
            Some(MutationWindow { ended: None, .. }) => false,
            Some(MutationWindow {
                ended: Some(ended), ..
            }) => generation > *ended,
        }
    }

    fn mutation_pending(&self) -> bool {
        matches!(self.mutation, Some(MutationWindow { ended: None, .. }))
    }

    fn idle(&self) -> bool {
        self.unsettled().is_none() && self.retry_pending.is_none() && !self.mutation_pending()
    }

    fn unsettled(&self) -> Option<&InFlight<T>> {
        self.in_flight.as_ref().filter(|f| !f.handle.is_settled())
    }
}

/// Outcome of finishing a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Write the result.
    Commit,
    /// Drop the result. `others_pending` says whether another fetch, retry
    /// or mutation still owns the key's in-progress flags.
    Discard { others_pending: bool },
}

pub struct RequestCoordinator<T> {
    keys: Mutex<HashMap<String, KeyFlight<T>>>,
}

impl<T> Default for RequestCoordinator<T> {
    fn default() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> RequestCoordinator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight fetch for `key` or start a new one.
    ///
    /// With `dedupe`, an entry dispatched less than `window` ago is joined
    /// and `start` is not called. Otherwise a generation is allocated and
    /// `start` builds the handle while the books are locked, so concurrent
    /// callers always observe either the old entry or the new one.
    ///
    /// Returns the handle and, when a fetch was started, its generation.
    pub fn dispatch<F>(
        &self,
        key: &str,
        dedupe: bool,
        window: Duration,
        now: Instant,
        start: F,
    ) -> (FetchHandle<T>, Option<Generation>)
    where
        F: FnOnce(Generation) -> FetchHandle<T>,
    {
        let mut keys = self.lock();
        let flight = keys.entry(key.to_string()).or_default();

        if dedupe {
            if let Some(existing) = &flight.in_flight {
                if now.saturating_duration_since(existing.started_at) < window {
                    return (existing.handle.clone(), None);
                }
            }
        }

        let generation = flight.next_generation();
        flight.latest_fetch = generation;
        flight.retry_pending = None;
        let handle = start(generation);
        flight.in_flight = Some(InFlight {
            generation,
            started_at: now,
            handle: handle.clone(),
        });
        (handle, Some(generation))
    }

    /// Settle fetch `generation` and decide the fate of its result.
    ///
    /// A successful fetch stays registered for the rest of its dedupe
    /// window; a failed one is dropped so later callers fetch again.
    pub fn finish(&self, key: &str, generation: Generation, ok: bool) -> Verdict {
        let mut keys = self.lock();
        let Some(flight) = keys.get_mut(key) else {
            return Verdict::Discard {
                others_pending: false,
            };
        };

        let commit = flight.commit_allowed(generation);
        let own_entry = flight
            .in_flight
            .as_ref()
            .is_some_and(|f| f.generation == generation);
        if own_entry && !ok {
            flight.in_flight = None;
        }

        if commit {
            Verdict::Commit
        } else {
            let others = flight
                .unsettled()
                .is_some_and(|f| f.generation != generation);
            Verdict::Discard {
                others_pending: others
                    || flight.retry_pending.is_some()
                    || flight.mutation_pending(),
            }
        }
    }

    /// Hand a failed fetch over to a retry. Returns `false` when the failure
    /// is no longer current, in which case it must be finished normally.
    ///
    /// The first retry of a chain opens a waiter that [`pending`](Self::pending)
    /// hands to blocking readers until the chain settles.
    pub fn begin_retry(&self, key: &str, generation: Generation) -> bool {
        let mut keys = self.lock();
        let Some(flight) = keys.get_mut(key) else {
            return false;
        };
        if !flight.commit_allowed(generation) {
            return false;
        }
        if flight
            .in_flight
            .as_ref()
            .is_some_and(|f| f.generation == generation)
        {
            flight.in_flight = None;
        }
        flight.retry_pending = Some(generation);
        if flight.waiter.is_none() {
            let (tx, rx) = oneshot::channel();
            let handle = FetchHandle::new(generation, async move {
                rx.await
                    .unwrap_or_else(|_| Err(FetchError::msg("retry abandoned")))
            });
            flight.waiter = Some(RetryWaiter { handle, tx });
        }
        true
    }

    /// Give up on the retry scheduled for failed fetch `generation`. Returns
    /// whether that retry was still pending.
    pub fn cancel_retry(&self, key: &str, generation: Generation) -> bool {
        let mut keys = self.lock();
        match keys.get_mut(key) {
            Some(flight) if flight.retry_pending == Some(generation) => {
                flight.retry_pending = None;
                true
            }
            _ => false,
        }
    }

    /// Take the sender resolving the key's retry waiter, if one is open.
    pub fn take_waiter(&self, key: &str) -> Option<oneshot::Sender<Result<T, FetchError>>> {
        self.lock()
            .get_mut(key)
            .and_then(|flight| flight.waiter.take())
            .map(|waiter| waiter.tx)
    }

    /// Like [`take_waiter`](Self::take_waiter), but only once no fetch,
    /// retry or mutation is left to settle the key.
    pub fn take_idle_waiter(&self, key: &str) -> Option<oneshot::Sender<Result<T, FetchError>>> {
        let mut keys = self.lock();
        let flight = keys.get_mut(key).filter(|flight| flight.idle())?;
        flight.waiter.take().map(|waiter| waiter.tx)
    }

    /// Whether nothing is running or pending on `key`.
    pub fn idle(&self, key: &str) -> bool {
        self.lock().get(key).map_or(true, KeyFlight::idle)
    }

    /// Whether a fetch or retry still owns the key's in-progress flags.
    pub fn busy(&self, key: &str) -> bool {
        self.lock().get(key).is_some_and(|flight| {
            flight.unsettled().is_some() || flight.retry_pending.is_some()
        })
    }

    /// Whether anything was dispatched on `key` after `generation`.
    pub fn is_superseded(&self, key: &str, generation: Generation) -> bool {
        self.lock()
            .get(key)
            .map_or(true, |flight| flight.generation != generation)
    }

    /// Whether a result of fetch `generation` could still be committed.
    pub fn is_current(&self, key: &str, generation: Generation) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|flight| flight.commit_allowed(generation))
    }

    /// Open a mutation window and return its generation plus the rollback
    /// snapshot. `visible` becomes the snapshot unless a window is already
    /// open, in which case the window's original snapshot is kept.
    pub fn begin_mutation(
        &self,
        key: &str,
        visible: Option<StateRecord<T>>,
    ) -> (Generation, Option<StateRecord<T>>) {
        let mut keys = self.lock();
        let flight = keys.entry(key.to_string()).or_default();
        let generation = flight.next_generation();
        flight.latest_mutation = generation;
        let snapshot = match flight.mutation.take() {
            Some(MutationWindow {
                ended: None,
                snapshot,
            }) => snapshot,
            _ => visible,
        };
        flight.mutation = Some(MutationWindow {
            ended: None,
            snapshot: snapshot.clone(),
        });
        (generation, snapshot)
    }

    /// Close mutation `generation`. Returns `false` when a newer mutation
    /// started meanwhile; that mutation keeps the window open.
    pub fn end_mutation(&self, key: &str, generation: Generation) -> bool {
        let mut keys = self.lock();
        let Some(flight) = keys.get_mut(key) else {
            return false;
        };
        if flight.latest_mutation != generation {
            return false;
        }
        let ended = flight.next_generation();
        flight.mutation = Some(MutationWindow {
            ended: Some(ended),
            snapshot: None,
        });
        true
    }

    /// Drop the in-flight entry so the next revalidation fetches anew.
    pub fn forget_in_flight(&self, key: &str) {
        if let Some(flight) = self.lock().get_mut(key) {
            flight.in_flight = None;
        }
    }

    /// Handle to wait on for `key`: the open retry waiter, else the
    /// unsettled fetch.
    pub fn pending(&self, key: &str) -> Option<FetchHandle<T>> {
        self.lock().get(key).and_then(|flight| match &flight.waiter {
            Some(waiter) => Some(waiter.handle.clone()),
            None => flight.unsettled().map(|f| f.handle.clone()),
        })
    }

    /// Latest generation allocated for `key`.
    pub fn generation(&self, key: &str) -> Generation {
        self.lock().get(key).map_or(0, |flight| flight.generation)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, KeyFlight<T>>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }
}
