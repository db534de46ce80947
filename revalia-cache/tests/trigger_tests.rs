//! Focus, reconnect and interval revalidation driven by a manual host.

use std::sync::Arc;
use std::time::Duration;

use revalia_cache::{HostEvent, Host, Key, SubscribeOptions, SwrConfig, SwrEngine};
use revalia_test_utils::{settle, ManualHost, RecordingObserver, ScriptedFetcher};
use tokio::time::advance;

fn engine_on(host: &Arc<ManualHost>, config: SwrConfig) -> SwrEngine<String> {
    SwrEngine::builder()
        .host(host.clone() as Arc<dyn Host>)
        .config(config)
        .build()
}

fn undeduped() -> SwrConfig {
    SwrConfig::default().with_deduping_interval(Duration::ZERO)
}

#[tokio::test(start_paused = true)]
async fn polling_waits_for_visibility() {
    let host = Arc::new(ManualHost::hidden());
    let config = undeduped()
        .with_refresh_interval(Duration::from_millis(1000))
        .with_revalidate_on_focus(false)
        .with_revalidate_on_mount(Some(false));
    let engine = engine_on(&host, config);
    let fetcher = ScriptedFetcher::always("tick".to_string());
    let _sub = engine.subscribe(&Key::from("/api/clock"), fetcher.shared(), RecordingObserver::new().observer());
    settle().await;

    advance(Duration::from_millis(1000)).await;
    settle().await;
    assert_eq!(fetcher.calls(), 0);

    host.set_visible(true);
    settle().await;
    assert_eq!(fetcher.calls(), 0, "focus revalidation is off");

    advance(Duration::from_millis(1000)).await;
    settle().await;
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn polling_skips_offline_unless_allowed() {
    let host = Arc::new(ManualHost::new());
    let base = undeduped()
        .with_refresh_interval(Duration::from_millis(500))
        .with_revalidate_on_mount(Some(false));
    let engine = engine_on(&host, base.clone());
    let strict = ScriptedFetcher::always("a".to_string());
    let lenient = ScriptedFetcher::always("b".to_string());
    let _strict = engine.subscribe(&Key::from("/strict"), strict.shared(), RecordingObserver::new().observer());
    let _lenient = engine.subscribe_with(
        &Key::from("/lenient"),
        Some(lenient.shared()),
        RecordingObserver::new().observer(),
        SubscribeOptions::new().config(base.with_refresh_when_offline(true)),
    );
    host.go_offline();
    settle().await;

    advance(Duration::from_millis(500)).await;
    settle().await;
    assert_eq!(strict.calls(), 0);
    assert_eq!(lenient.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn focus_revalidation_is_throttled_per_subscriber() {
    let host = Arc::new(ManualHost::new());
    let config = undeduped().with_focus_throttle_interval(Duration::from_millis(5000));
    let engine = engine_on(&host, config);
    let fetcher = ScriptedFetcher::always("fresh".to_string());
    let _sub = engine.subscribe(&Key::from("/api/inbox"), fetcher.shared(), RecordingObserver::new().observer());
    settle().await;
    assert_eq!(fetcher.calls(), 1, "mount fetch");

    host.focus();
    settle().await;
    assert_eq!(fetcher.calls(), 2);

    host.focus();
    settle().await;
    assert_eq!(fetcher.calls(), 2, "second focus inside the throttle window");

    advance(Duration::from_millis(5000)).await;
    host.focus();
    settle().await;
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn focus_while_hidden_is_ignored() {
    let host = Arc::new(ManualHost::new());
    let engine = engine_on(&host, undeduped());
    let fetcher = ScriptedFetcher::always("x".to_string());
    let _sub = engine.subscribe(&Key::from("/api/x"), fetcher.shared(), RecordingObserver::new().observer());
    settle().await;

    host.set_visible(false);
    engine.dispatch(HostEvent::Focus);
    settle().await;
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn focus_event_without_focus_is_ignored() {
    let host = Arc::new(ManualHost::new());
    let engine = engine_on(&host, undeduped());
    let fetcher = ScriptedFetcher::always("x".to_string());
    let _sub = engine.subscribe(&Key::from("/api/x"), fetcher.shared(), RecordingObserver::new().observer());
    settle().await;

    host.blur();
    engine.dispatch(HostEvent::Focus);
    settle().await;
    assert_eq!(fetcher.calls(), 1);

    engine.dispatch(HostEvent::VisibilityChange);
    settle().await;
    assert_eq!(fetcher.calls(), 2, "visibility changes do not need focus");
}

#[tokio::test(start_paused = true)]
async fn reconnect_revalidates_bound_subscribers() {
    let host = Arc::new(ManualHost::new());
    let engine = engine_on(&host, undeduped());
    let eager = ScriptedFetcher::always("e".to_string());
    let quiet = ScriptedFetcher::always("q".to_string());
    let _eager = engine.subscribe(&Key::from("/eager"), eager.shared(), RecordingObserver::new().observer());
    let _quiet = engine.subscribe_with(
        &Key::from("/quiet"),
        Some(quiet.shared()),
        RecordingObserver::new().observer(),
        SubscribeOptions::new().config(undeduped().with_revalidate_on_reconnect(false)),
    );
    settle().await;

    host.go_offline();
    settle().await;
    assert_eq!(eager.calls(), 1);

    host.go_online();
    settle().await;
    assert_eq!(eager.calls(), 2);
    assert_eq!(quiet.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn watchers_without_fetcher_are_not_revalidated() {
    let host = Arc::new(ManualHost::new());
    let engine = engine_on(&host, undeduped());
    let recorder = RecordingObserver::new();
    let _watch = engine.watch(&Key::from("/api/x"), recorder.observer());

    host.focus();
    host.go_online();
    settle().await;
    assert_eq!(recorder.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn dynamic_interval_of_zero_stops_polling() {
    let host = Arc::new(ManualHost::new());
    let engine = engine_on(&host, undeduped());
    let fetcher = ScriptedFetcher::new([
        Ok("working".to_string()),
        Ok("done".to_string()),
        Ok("never".to_string()),
    ]);
    let _sub = engine.subscribe_with(
        &Key::from("/api/job"),
        Some(fetcher.shared()),
        RecordingObserver::new().observer(),
        SubscribeOptions::new().refresh_interval_fn(|data: Option<&String>| {
            if data.is_some_and(|d| d == "done") {
                Duration::ZERO
            } else {
                Duration::from_millis(100)
            }
        }),
    );
    settle().await;
    assert_eq!(fetcher.calls(), 1);

    advance(Duration::from_millis(100)).await;
    settle().await;
    assert_eq!(fetcher.calls(), 2);

    advance(Duration::from_millis(1000)).await;
    settle().await;
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(engine.get_data(&Key::from("/api/job")).as_deref(), Some("done"));
}

#[tokio::test(start_paused = true)]
async fn subscribers_of_one_key_share_trigger_fetches() {
    let host = Arc::new(ManualHost::new());
    let engine = engine_on(&host, SwrConfig::default());
    let fetcher = ScriptedFetcher::always("shared".to_string());
    let key = Key::from("/api/shared");

    let subs: Vec<_> = (0..3)
        .map(|_| engine.subscribe(&key, fetcher.shared(), RecordingObserver::new().observer()))
        .collect();
    settle().await;
    assert_eq!(fetcher.calls(), 1);

    advance(Duration::from_millis(3000)).await;
    host.focus();
    settle().await;
    assert_eq!(fetcher.calls(), 2);
    assert!(subs.iter().all(|s| s.data().as_deref() == Some("shared")));
}

#[tokio::test(start_paused = true)]
async fn dropped_subscription_stops_polling() {
    let host = Arc::new(ManualHost::new());
    let config = undeduped()
        .with_refresh_interval(Duration::from_millis(200))
        .with_revalidate_on_mount(Some(false));
    let engine = engine_on(&host, config);
    let fetcher = ScriptedFetcher::always("p".to_string());
    let sub = engine.subscribe(&Key::from("/api/poll"), fetcher.shared(), RecordingObserver::new().observer());
    settle().await;

    advance(Duration::from_millis(200)).await;
    settle().await;
    assert_eq!(fetcher.calls(), 1);

    drop(sub);
    advance(Duration::from_millis(1000)).await;
    settle().await;
    assert_eq!(fetcher.calls(), 1);
}
