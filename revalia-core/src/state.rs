//! Per-key cache state and partial updates.

use crate::error::FetchError;

/// Cached state for one serialized key.
///
/// `data` and `error` may coexist: stale data survives a failed
/// revalidation. `timestamp` is a logical clock value that never decreases
/// for a given key and only advances when `data` or `error` changes.
#[derive(Debug, Clone)]
pub struct StateRecord<T> {
    pub data: Option<T>,
    pub error: Option<FetchError>,
    pub is_validating: bool,
    pub is_loading: bool,
    pub timestamp: u64,
}

impl<T> Default for StateRecord<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_validating: false,
            is_loading: false,
            timestamp: 0,
        }
    }
}

impl<T> StateRecord<T> {
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Compare everything except the timestamp.
    pub fn content_eq(&self, other: &Self) -> bool
    where
        T: PartialEq,
    {
        self.data == other.data
            && same_error(self.error.as_ref(), other.error.as_ref())
            && self.is_validating == other.is_validating
            && self.is_loading == other.is_loading
    }
}

fn same_error(a: Option<&FetchError>, b: Option<&FetchError>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_as(b),
        _ => false,
    }
}

/// Partial update merged into a [`StateRecord`].
///
/// `None` leaves a field untouched; `Some(None)` clears an optional field.
#[derive(Debug, Clone)]
pub struct StatePatch<T> {
    pub data: Option<Option<T>>,
    pub error: Option<Option<FetchError>>,
    pub is_validating: Option<bool>,
    pub is_loading: Option<bool>,
}

impl<T> Default for StatePatch<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_validating: None,
            is_loading: None,
        }
    }
}

impl<T> StatePatch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(mut self, data: T) -> Self {
        self.data = Some(Some(data));
        self
    }

    pub fn error(mut self, error: FetchError) -> Self {
        self.error = Some(Some(error));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn validating(mut self, value: bool) -> Self {
        self.is_validating = Some(value);
        self
    }

    pub fn loading(mut self, value: bool) -> Self {
        self.is_loading = Some(value);
        self
    }

    /// Clear both in-progress flags.
    pub fn settled(self) -> Self {
        self.validating(false).loading(false)
    }

    /// Patch that turns `base` into a copy of `target`'s content.
    pub fn replace_with(target: &StateRecord<T>) -> Self
    where
        T: Clone,
    {
        Self {
            data: Some(target.data.clone()),
            error: Some(target.error.clone()),
            is_validating: Some(target.is_validating),
            is_loading: Some(target.is_loading),
        }
    }

    /// Merge into `base`. Returns the merged record (timestamp untouched) and
    /// whether `data` or `error` actually changed.
    pub fn apply<F>(self, base: &StateRecord<T>, same_data: F) -> (StateRecord<T>, bool)
    where
        T: Clone,
        F: Fn(&T, &T) -> bool,
    {
        let mut merged = base.clone();
        let mut changed = false;

        if let Some(data) = self.data {
            let same = match (&base.data, &data) {
                (None, None) => true,
                (Some(a), Some(b)) => same_data(a, b),
                _ => false,
            };
            changed |= !same;
            merged.data = data;
        }
        if let Some(error) = self.error {
            changed |= !same_error(base.error.as_ref(), error.as_ref());
            merged.error = error;
        }
        if let Some(v) = self.is_validating {
            merged.is_validating = v;
        }
        if let Some(v) = self.is_loading {
            merged.is_loading = v;
        }

        (merged, changed)
    }
}

/// Receives every state change of the keys it is subscribed to.
///
/// Called synchronously inside the update that produced `state`; every
/// observer of a key sees the same record for one notification.
pub trait StateObserver<T>: Send + Sync {
    fn on_state_change(&self, key: &str, state: &StateRecord<T>);
}

impl<T, F> StateObserver<T> for F
where
    F: Fn(&str, &StateRecord<T>) + Send + Sync,
{
    fn on_state_change(&self, key: &str, state: &StateRecord<T>) {
        self(key, state)
    }
}
