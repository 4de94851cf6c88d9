use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use quarry::cache::{
    Api, EndpointDefinition, FetchContext, FetchResult, MAX_TIMER_DELAY, Payload, QueryEngine,
    StartQueryOptions, SubscriptionOptions,
};
use tokio::time::{Instant, sleep};

const FETCH_TIME: Duration = Duration::from_secs(2);

fn slow_api(calls: Arc<AtomicUsize>) -> Api {
    Api::builder()
        .endpoint(
            "getFeed",
            EndpointDefinition::query(move |args: Payload, _ctx: FetchContext| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleep(FETCH_TIME).await;
                    FetchResult::ok(args)
                }
            }),
        )
        .build()
}

fn slow_engine(calls: Arc<AtomicUsize>) -> QueryEngine {
    QueryEngine::builder(slow_api(calls)).build().expect("engine")
}

fn polling(secs: u64) -> StartQueryOptions {
    StartQueryOptions::default().polling_interval(Duration::from_secs(secs))
}

fn assert_near(actual: Option<Instant>, expected: Instant) {
    let actual = actual.expect("poll armed");
    let drift = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(drift < Duration::from_millis(10), "drift {drift:?}");
}

#[tokio::test(start_paused = true)]
async fn lowest_interval_wins_and_restarts_after_completion() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = slow_engine(Arc::clone(&calls));
    let started = Instant::now();

    let handles: Vec<_> = [30, 10, 20]
        .into_iter()
        .map(|secs| engine.start_query("getFeed", 1, polling(secs)).expect("start"))
        .collect();
    handles[0].settled().await;
    let key = handles[0].cache_key().clone();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_near(engine.next_poll(&key), started + FETCH_TIME + Duration::from_secs(10));

    sleep_until_offset(started, Duration::from_secs(15)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // 12s poll start + 2s fetch + 10s interval
    assert_near(engine.next_poll(&key), started + Duration::from_secs(24));
}

async fn sleep_until_offset(started: Instant, offset: Duration) {
    tokio::time::sleep_until(started + offset).await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribing_all_pollers_stops_polling() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = slow_engine(Arc::clone(&calls));

    let handle = engine.start_query("getFeed", 1, polling(5)).expect("start");
    handle.settled().await;
    assert!(engine.next_poll(handle.cache_key()).is_some());

    handle.unsubscribe();
    assert!(engine.next_poll(handle.cache_key()).is_none());

    sleep(Duration::from_secs(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn zero_interval_does_not_poll() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = slow_engine(Arc::clone(&calls));

    let handle = engine
        .start_query(
            "getFeed",
            1,
            StartQueryOptions::default().subscription(SubscriptionOptions::default().polling_interval(Duration::ZERO)),
        )
        .expect("start");
    handle.settled().await;

    assert!(engine.next_poll(handle.cache_key()).is_none());
}

#[tokio::test(start_paused = true)]
async fn unfocused_poll_is_skipped_and_rearmed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = slow_engine(Arc::clone(&calls));
    let started = Instant::now();

    let handle = engine
        .start_query(
            "getFeed",
            1,
            StartQueryOptions::default().subscription(
                SubscriptionOptions::default()
                    .polling_interval(Duration::from_secs(10))
                    .skip_polling_if_unfocused(true),
            ),
        )
        .expect("start");
    handle.settled().await;
    engine.set_focused(false);

    sleep_until_offset(started, Duration::from_secs(13)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_near(engine.next_poll(handle.cache_key()), started + Duration::from_secs(22));
}

#[tokio::test(start_paused = true)]
async fn shorter_interval_update_rearms_sooner() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = slow_engine(Arc::clone(&calls));

    let handle = engine.start_query("getFeed", 1, polling(60)).expect("start");
    handle.settled().await;
    let before = engine.next_poll(handle.cache_key()).expect("armed");

    handle.update_subscription_options(
        SubscriptionOptions::default().polling_interval(Duration::from_secs(5)),
    );
    let after = engine.next_poll(handle.cache_key()).expect("armed");
    assert!(after < before);
}

#[tokio::test(start_paused = true)]
async fn oversized_interval_is_clamped_to_timer_ceiling() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = QueryEngine::builder(slow_api(Arc::clone(&calls)))
        .max_timer_delay(Duration::from_secs(30))
        .build()
        .expect("engine");
    let started = Instant::now();

    let handle = engine
        .start_query(
            "getFeed",
            1,
            StartQueryOptions::default().polling_interval(Duration::MAX),
        )
        .expect("start");
    handle.settled().await;

    assert_near(
        engine.next_poll(handle.cache_key()),
        started + FETCH_TIME + Duration::from_secs(30),
    );
}

#[tokio::test(start_paused = true)]
async fn oversized_interval_uses_default_ceiling() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = slow_engine(Arc::clone(&calls));
    let started = Instant::now();

    let handle = engine
        .start_query(
            "getFeed",
            1,
            StartQueryOptions::default().polling_interval(Duration::MAX),
        )
        .expect("start");
    handle.settled().await;

    assert_near(
        engine.next_poll(handle.cache_key()),
        started + FETCH_TIME + MAX_TIMER_DELAY,
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
