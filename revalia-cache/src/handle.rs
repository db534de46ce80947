//! Handles over in-flight fetches.
//!
//! A [`FetchHandle`] is a cloneable, awaitable view of one dispatched fetch.
//! Every caller collapsed into the same request holds a clone and observes
//! the same result. The handle can also be inspected without polling, which
//! is how blocking readers decide whether to suspend.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use revalia_core::{FetchError, Generation};

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

/// Settlement status of a fetch.
#[derive(Debug, Clone)]
pub enum TaskStatus<T> {
    Pending,
    Resolved(T),
    Rejected(FetchError),
}

impl<T> TaskStatus<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Awaitable result of one dispatched fetch.
pub struct FetchHandle<T> {
    generation: Generation,
    inner: SharedFetch<T>,
}

impl<T> Clone for FetchHandle<T> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> FetchHandle<T> {
    pub(crate) fn new<F>(generation: Generation, fut: F) -> Self
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        Self {
            generation,
            inner: fut.boxed().shared(),
        }
    }

    /// Generation the fetch was dispatched with.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Current status, without driving the fetch.
    pub fn status(&self) -> TaskStatus<T> {
        match self.inner.peek() {
            None => TaskStatus::Pending,
            Some(Ok(value)) => TaskStatus::Resolved(value.clone()),
            Some(Err(error)) => TaskStatus::Rejected(error.clone()),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.peek().is_some()
    }
}

impl<T: Clone + Send + Sync + 'static> Future for FetchHandle<T> {
    type Output = Result<T, FetchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.poll_unpin(cx)
    }
}

impl<T> std::fmt::Debug for FetchHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchHandle")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
