//! Blocking reads that land while a failed fetch waits for its retry.

use std::time::Duration;

use revalia_cache::{
    FetchError, Key, MutateOptions, Mutation, Suspense, SuspenseError, SwrConfig, SwrEngine,
};
use revalia_test_utils::{settle, ScriptedFetcher};
use tokio::time::advance;

fn engine_with_backoff(count: u32) -> SwrEngine<String> {
    SwrEngine::builder()
        .config(
            SwrConfig::default()
                .with_error_retry_interval(Duration::from_millis(1000))
                .with_error_retry_count(Some(count))
                .with_error_retry_jitter(false),
        )
        .build()
}

async fn fail_first_fetch(
    engine: &SwrEngine<String>,
    key: &Key,
    fetcher: &std::sync::Arc<ScriptedFetcher<String>>,
) {
    let Suspense::Pending(first) = engine.read(key, fetcher.shared(), None).unwrap() else {
        panic!("expected a pending fetch");
    };
    assert!(first.await.is_err());
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn read_during_backoff_waits_for_retry() {
    let engine = engine_with_backoff(3);
    let key = Key::from("/api/feed");
    let fetcher = ScriptedFetcher::new([Err(FetchError::msg("blip")), Ok("ok".to_string())]);
    fail_first_fetch(&engine, &key, &fetcher).await;

    let Suspense::Pending(waiting) = engine.read(&key, fetcher.shared(), None).unwrap() else {
        panic!("expected to wait on the retry");
    };
    settle().await;
    assert_eq!(fetcher.calls(), 1, "backoff must not be skipped");

    advance(Duration::from_millis(999)).await;
    settle().await;
    assert_eq!(fetcher.calls(), 1);

    advance(Duration::from_millis(1)).await;
    assert_eq!(waiting.await.unwrap(), "ok");
    assert_eq!(fetcher.calls(), 2);
    assert!(engine.read(&key, fetcher.shared(), None).unwrap().is_ready());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_reject_waiting_reader() {
    let engine = engine_with_backoff(1);
    let key = Key::from("/api/feed");
    let fetcher = ScriptedFetcher::new([Err(FetchError::msg("down"))]);
    fail_first_fetch(&engine, &key, &fetcher).await;

    let suspended = tokio::spawn({
        let engine = engine.clone();
        let key = key.clone();
        let fetcher = fetcher.shared();
        async move { engine.suspend(&key, fetcher, None).await }
    });
    settle().await;

    advance(Duration::from_millis(1000)).await;
    let err = suspended.await.unwrap().unwrap_err();
    assert!(matches!(err, SuspenseError::Rejected(ref e) if e.message() == "down"));
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn mutation_during_backoff_wakes_reader_with_local_data() {
    let engine = engine_with_backoff(3);
    let key = Key::from("/api/feed");
    let fetcher = ScriptedFetcher::new([Err(FetchError::msg("blip"))]);
    fail_first_fetch(&engine, &key, &fetcher).await;

    let Suspense::Pending(waiting) = engine.read(&key, fetcher.shared(), None).unwrap() else {
        panic!("expected to wait on the retry");
    };
    engine
        .mutate(&key, Mutation::Value("local".to_string()), MutateOptions::new().revalidate(false))
        .await
        .unwrap();

    advance(Duration::from_millis(1000)).await;
    assert_eq!(waiting.await.unwrap(), "local");
    assert_eq!(fetcher.calls(), 1, "the superseded retry never ran");
    settle().await;
    assert!(!engine.get(&key).unwrap().is_validating);
}
