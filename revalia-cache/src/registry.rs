//! Subscriber Registry: who is watching which key.
//!
//! Subscribers are kept per serialized key in registration order. A
//! subscriber may carry a [`Binding`], the fetcher and config it was
//! attached with; bound subscribers are what triggers and bound mutations
//! revalidate through.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use revalia_core::{ActiveKey, SharedFetcher, StateObserver, StateRecord, SwrConfig};
use tokio::time::Instant;
use tracing::trace;

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Fetcher and options a subscriber revalidates with.
pub struct Binding<T> {
    pub key: ActiveKey,
    pub fetcher: SharedFetcher<T>,
    pub config: Arc<SwrConfig>,
}

impl<T> Clone for Binding<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            fetcher: Arc::clone(&self.fetcher),
            config: Arc::clone(&self.config),
        }
    }
}

pub struct Subscriber<T> {
    id: SubscriberId,
    observer: Arc<dyn StateObserver<T>>,
    binding: Option<Binding<T>>,
    next_focus_at: Mutex<Option<Instant>>,
}

impl<T> Subscriber<T> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn binding(&self) -> Option<&Binding<T>> {
        self.binding.as_ref()
    }

    /// Focus throttle. Passes at most once per `throttle`; a pass arms the
    /// next window starting at `now`.
    pub fn try_pass_focus(&self, now: Instant, throttle: Duration) -> bool {
        let mut next = self.next_focus_at.lock().unwrap_or_else(|e| e.into_inner());
        match *next {
            Some(at) if now < at => false,
            _ => {
                *next = Some(now + throttle);
                true
            }
        }
    }
}

pub struct SubscriberRegistry<T> {
    slots: Mutex<HashMap<String, Vec<Arc<Subscriber<T>>>>>,
    next_id: AtomicU64,
}

impl<T> Default for SubscriberRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriberRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber for `key`. Returns it together with the key's
    /// subscriber count after registration.
    pub fn subscribe(
        &self,
        key: &str,
        observer: Arc<dyn StateObserver<T>>,
        binding: Option<Binding<T>>,
    ) -> (Arc<Subscriber<T>>, usize) {
        let subscriber = Arc::new(Subscriber {
            id: SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            observer,
            binding,
            next_focus_at: Mutex::new(None),
        });

        let mut slots = self.lock();
        let list = slots.entry(key.to_string()).or_default();
        list.push(Arc::clone(&subscriber));
        let count = list.len();
        trace!(key = %key, id = %subscriber.id, count, "subscribed");
        (subscriber, count)
    }

    /// Register a plain observer with no fetcher.
    pub fn subscribe_observer(&self, key: &str, observer: Arc<dyn StateObserver<T>>) -> SubscriberId {
        self.subscribe(key, observer, None).0.id
    }

    /// Remove a registration. Returns the number of subscribers left.
    pub fn unsubscribe(&self, key: &str, id: SubscriberId) -> usize {
        let mut slots = self.lock();
        let Some(list) = slots.get_mut(key) else {
            return 0;
        };
        list.retain(|s| s.id != id);
        let remaining = list.len();
        if remaining == 0 {
            slots.remove(key);
        }
        trace!(key = %key, id = %id, remaining, "unsubscribed");
        remaining
    }

    /// Deliver `state` to every subscriber of `key`, in registration order.
    ///
    /// The list is copied first so callbacks may subscribe or unsubscribe.
    pub fn notify(&self, key: &str, state: &StateRecord<T>) {
        for subscriber in self.subscribers(key) {
            subscriber.observer.on_state_change(key, state);
        }
    }

    pub fn subscribers(&self, key: &str) -> Vec<Arc<Subscriber<T>>> {
        self.lock().get(key).cloned().unwrap_or_default()
    }

    /// First subscriber of `key` that has a fetcher.
    pub fn first_bound(&self, key: &str) -> Option<Arc<Subscriber<T>>> {
        self.lock()
            .get(key)
            .and_then(|list| list.iter().find(|s| s.binding.is_some()).cloned())
    }

    /// Every bound subscriber across all keys.
    pub fn bound(&self) -> Vec<Arc<Subscriber<T>>> {
        self.lock()
            .values()
            .flatten()
            .filter(|s| s.binding.is_some())
            .cloned()
            .collect()
    }

    pub fn count(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Arc<Subscriber<T>>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder(log: Arc<StdMutex<Vec<(u8, Option<i32>)>>>, tag: u8) -> Arc<dyn StateObserver<i32>> {
        Arc::new(move |_: &str, state: &StateRecord<i32>| {
            log.lock().unwrap().push((tag, state.data));
        })
    }

    #[test]
    fn test_counts_follow_subscribe_and_unsubscribe() {
        let registry = SubscriberRegistry::<i32>::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let (a, count) = registry.subscribe("k", recorder(log.clone(), 1), None);
        assert_eq!(count, 1);
        let (b, count) = registry.subscribe("k", recorder(log.clone(), 2), None);
        assert_eq!(count, 2);
        assert_ne!(a.id(), b.id());

        assert_eq!(registry.unsubscribe("k", a.id()), 1);
        assert_eq!(registry.unsubscribe("k", b.id()), 0);
        assert_eq!(registry.count("k"), 0);
        assert_eq!(registry.unsubscribe("k", b.id()), 0);
    }

    #[test]
    fn test_notify_in_registration_order_with_same_record() {
        let registry = SubscriberRegistry::<i32>::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        registry.subscribe_observer("k", recorder(log.clone(), 1));
        registry.subscribe_observer("k", recorder(log.clone(), 2));
        registry.subscribe_observer("other", recorder(log.clone(), 3));

        let state = StateRecord {
            data: Some(8),
            ..Default::default()
        };
        registry.notify("k", &state);

        assert_eq!(*log.lock().unwrap(), vec![(1, Some(8)), (2, Some(8))]);
    }

    #[test]
    fn test_callback_may_unsubscribe_during_notify() {
        let registry = Arc::new(SubscriberRegistry::<i32>::new());
        let slot: Arc<StdMutex<Option<SubscriberId>>> = Arc::new(StdMutex::new(None));

        let reg = Arc::clone(&registry);
        let own = Arc::clone(&slot);
        let id = registry.subscribe_observer(
            "k",
            Arc::new(move |key: &str, _: &StateRecord<i32>| {
                if let Some(id) = *own.lock().unwrap() {
                    reg.unsubscribe(key, id);
                }
            }),
        );
        *slot.lock().unwrap() = Some(id);

        registry.notify("k", &StateRecord::default());
        assert_eq!(registry.count("k"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_throttle() {
        let registry = SubscriberRegistry::<i32>::new();
        let (sub, _) = registry.subscribe("k", Arc::new(|_: &str, _: &StateRecord<i32>| {}), None);
        let throttle = Duration::from_millis(5000);

        let start = Instant::now();
        assert!(sub.try_pass_focus(start, throttle));
        assert!(!sub.try_pass_focus(start + Duration::from_millis(4999), throttle));
        assert!(sub.try_pass_focus(start + Duration::from_millis(5000), throttle));
    }

    #[test]
    fn test_first_bound_skips_plain_observers() {
        let registry = SubscriberRegistry::<i32>::new();
        registry.subscribe_observer("k", Arc::new(|_: &str, _: &StateRecord<i32>| {}));
        assert!(registry.first_bound("k").is_none());
        assert!(registry.bound().is_empty());
    }
}
