//! Fetch function contract.
//!
//! The engine is not a network client: callers supply a [`Fetcher`] that
//! turns a key's arguments into a value.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::key::KeyArg;

/// Produces the value for a key.
///
/// `args` are the resolved key arguments: the elements of a list key, or a
/// one-element slice for a scalar or object key.
#[async_trait]
pub trait Fetcher<T>: Send + Sync {
    async fn fetch(&self, args: &[KeyArg]) -> Result<T, FetchError>;
}

/// Shared fetcher handle as stored by the engine.
pub type SharedFetcher<T> = Arc<dyn Fetcher<T>>;

/// Adapter turning an async closure into a [`Fetcher`].
pub struct FnFetcher<T, F> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> Fetcher<T> for FnFetcher<T, F>
where
    T: Send + 'static,
    F: Fn(Vec<KeyArg>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, FetchError>> + Send,
{
    async fn fetch(&self, args: &[KeyArg]) -> Result<T, FetchError> {
        (self.f)(args.to_vec()).await
    }
}

/// Wrap an async closure as a shared fetcher.
///
/// ```ignore
/// let fetcher = fetcher_fn(|args| async move {
///     client.get_user(&args).await.map_err(FetchError::from_error)
/// });
/// ```
pub fn fetcher_fn<T, F, Fut>(f: F) -> SharedFetcher<T>
where
    T: Send + 'static,
    F: Fn(Vec<KeyArg>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    Arc::new(FnFetcher {
        f,
        _marker: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetcher_fn_receives_args() {
        let fetcher = fetcher_fn(|args: Vec<KeyArg>| async move {
            match args.first() {
                Some(KeyArg::Str(s)) => Ok(s.len()),
                _ => Err(FetchError::msg("expected a string")),
            }
        });

        let ok = fetcher.fetch(&[KeyArg::from("/api")]).await;
        assert_eq!(ok.ok(), Some(4));

        let err = fetcher.fetch(&[KeyArg::Int(1)]).await;
        assert!(err.is_err());
    }
}
