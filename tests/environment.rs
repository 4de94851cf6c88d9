use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use quarry::cache::{
    Api, EndpointDefinition, EngineBuilder, EnvironmentSignal, FetchContext, FetchResult, Payload,
    QueryEngine, StartQueryOptions, SubscriptionOptions, setup_listeners,
};

fn builder(calls: Arc<AtomicUsize>) -> EngineBuilder {
    let api = Api::builder()
        .endpoint(
            "getPost",
            EndpointDefinition::query(move |args: Payload, _ctx: FetchContext| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    FetchResult::ok(args)
                }
            }),
        )
        .build();
    QueryEngine::builder(api)
}

#[tokio::test]
async fn regaining_focus_refetches_subscribed_entries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = builder(Arc::clone(&calls))
        .refetch_on_focus(true)
        .build()
        .expect("engine");
    engine
        .start_query("getPost", 1, StartQueryOptions::default())
        .expect("start")
        .await;

    engine.set_focused(false);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    engine.set_focused(true);
    assert!(engine.select_query("getPost", 1).expect("select").is_fetching());

    engine.settle_running().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn focus_without_transition_does_nothing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = builder(Arc::clone(&calls))
        .refetch_on_focus(true)
        .build()
        .expect("engine");
    engine
        .start_query("getPost", 1, StartQueryOptions::default())
        .expect("start")
        .await;

    // already focused
    engine.set_focused(true);
    engine.settle_running().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subscriber_opt_out_wins_over_engine_default() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = builder(Arc::clone(&calls))
        .refetch_on_reconnect(true)
        .build()
        .expect("engine");
    engine
        .start_query(
            "getPost",
            1,
            StartQueryOptions::default()
                .subscription(SubscriptionOptions::default().refetch_on_reconnect(false)),
        )
        .expect("start")
        .await;

    engine.set_online(false);
    engine.set_online(true);
    engine.settle_running().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subscriber_opt_in_refetches_without_engine_default() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = builder(Arc::clone(&calls)).build().expect("engine");
    engine
        .start_query(
            "getPost",
            1,
            StartQueryOptions::default()
                .subscription(SubscriptionOptions::default().refetch_on_focus(true)),
        )
        .expect("start")
        .await;

    engine.set_focused(false);
    engine.set_focused(true);
    engine.settle_running().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reconnect_sweeps_unsubscribed_entries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = builder(Arc::clone(&calls))
        .refetch_on_reconnect(true)
        .build()
        .expect("engine");
    engine
        .start_query("getPost", 1, StartQueryOptions::unsubscribed())
        .expect("start")
        .await;

    engine.set_online(false);
    engine.set_online(true);

    assert!(engine.select_query("getPost", 1).expect("select").is_uninitialized());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn listener_feeds_signals_into_engine() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = builder(Arc::clone(&calls))
        .refetch_on_focus(true)
        .build()
        .expect("engine");
    engine
        .start_query("getPost", 1, StartQueryOptions::default())
        .expect("start")
        .await;

    let signals = futures::stream::iter([
        EnvironmentSignal::Unfocused,
        EnvironmentSignal::Offline,
        EnvironmentSignal::Focused,
    ]);
    let listener = setup_listeners(&engine, signals);
    while !listener.is_finished() {
        tokio::task::yield_now().await;
    }

    let config = engine.config();
    assert!(config.focused);
    assert!(!config.online);
    engine.settle_running().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stopped_listener_ignores_later_signals() {
    let engine = builder(Arc::new(AtomicUsize::new(0)))
        .build()
        .expect("engine");
    let (tx, rx) = futures::channel::mpsc::unbounded();

    let listener = setup_listeners(&engine, rx);
    listener.shutdown().await;

    let _ = tx.unbounded_send(EnvironmentSignal::Offline);
    tokio::task::yield_now().await;
    assert!(engine.config().online);
}
