use quarry::cache::{
    Api, CacheEntryContext, EndpointDefinition, FetchContext, FetchResult, MutationOptions,
    Payload, QueryEngine, QueryStartedContext, StartQueryOptions,
};
use quarry::LifecycleError;
use tokio::sync::mpsc;

#[derive(Debug, PartialEq)]
enum Event {
    Started(Result<Payload, LifecycleError>),
    Loaded(Result<Payload, LifecycleError>),
    Removed,
}

fn fetch_post(args: Payload) -> FetchResult {
    match args.as_i64() {
        Some(404) => FetchResult::err("missing"),
        _ => FetchResult::ok(args),
    }
}

fn engine(events: mpsc::UnboundedSender<Event>) -> QueryEngine {
    let started = events.clone();
    let entries = events;
    let api = Api::builder()
        .endpoint(
            "getPost",
            EndpointDefinition::query(|args: Payload, _ctx: FetchContext| async move {
                if args.as_i64() == Some(0) {
                    futures::future::pending::<()>().await;
                }
                fetch_post(args)
            })
            .on_query_started(move |ctx: QueryStartedContext| {
                let tx = started.clone();
                async move {
                    let _ = tx.send(Event::Started(ctx.fulfilled.await));
                }
            })
            .on_cache_entry_added(move |ctx: CacheEntryContext| {
                let tx = entries.clone();
                async move {
                    let _ = tx.send(Event::Loaded(ctx.data_loaded.await));
                    ctx.entry_removed.await;
                    let _ = tx.send(Event::Removed);
                }
            }),
        )
        .endpoint(
            "addPost",
            EndpointDefinition::mutation(|args: Payload, _ctx: FetchContext| async move {
                FetchResult::ok(args)
            }),
        )
        .build();
    QueryEngine::builder(api).build().expect("engine")
}

#[tokio::test]
async fn started_hook_receives_own_outcome() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = engine(tx);

    engine
        .start_query("getPost", 1, StartQueryOptions::default())
        .expect("start")
        .await;

    let mut events = vec![rx.recv().await.expect("event"), rx.recv().await.expect("event")];
    events.sort_by_key(|event| matches!(event, Event::Loaded(_)));
    assert_eq!(events[0], Event::Started(Ok(Payload::from(1))));
    assert_eq!(events[1], Event::Loaded(Ok(Payload::from(1))));
}

#[tokio::test]
async fn started_hook_sees_rejection() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = engine(tx);

    engine
        .start_query("getPost", 404, StartQueryOptions::default())
        .expect("start")
        .await;

    let event = rx.recv().await.expect("event");
    assert_eq!(
        event,
        Event::Started(Err(LifecycleError::Rejected {
            error: Payload::from("missing"),
        }))
    );
}

#[tokio::test]
async fn entry_removed_after_data_loaded() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = engine(tx);

    engine
        .start_query("getPost", 1, StartQueryOptions::default())
        .expect("start")
        .await;
    assert_eq!(engine.open_cache_entries(), 1);

    assert!(engine.remove_query("getPost", 1).expect("remove"));
    assert_eq!(engine.open_cache_entries(), 0);

    let mut seen = Vec::new();
    while seen.len() < 3 {
        seen.push(rx.recv().await.expect("event"));
    }
    let loaded = seen
        .iter()
        .position(|event| *event == Event::Loaded(Ok(Payload::from(1))))
        .expect("loaded");
    let removed = seen
        .iter()
        .position(|event| *event == Event::Removed)
        .expect("removed");
    assert!(loaded < removed);
}

#[tokio::test]
async fn removal_before_first_value_never_resolves() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = engine(tx);

    let _pending = engine
        .start_query("getPost", 0, StartQueryOptions::default())
        .expect("start");
    assert!(engine.remove_query("getPost", 0).expect("remove"));

    assert_eq!(
        rx.recv().await.expect("event"),
        Event::Loaded(Err(LifecycleError::NeverResolved))
    );
    assert_eq!(rx.recv().await.expect("event"), Event::Removed);
}

#[tokio::test]
async fn refetch_does_not_reopen_entry() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = engine(tx);

    let handle = engine
        .start_query("getPost", 1, StartQueryOptions::default())
        .expect("start");
    handle.settled().await;
    handle.refetch().expect("refetch").await;

    let mut loaded = 0;
    let mut started = 0;
    for _ in 0..3 {
        match rx.recv().await.expect("event") {
            Event::Loaded(_) => loaded += 1,
            Event::Started(_) => started += 1,
            Event::Removed => {}
        }
    }
    assert_eq!(loaded, 1);
    assert_eq!(started, 2);
    assert_eq!(engine.open_cache_entries(), 1);
}

#[tokio::test]
async fn reset_closes_open_entries() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let engine = engine(tx);

    engine
        .start_query("getPost", 1, StartQueryOptions::default())
        .expect("start")
        .await;
    engine
        .start_mutation("addPost", 1, MutationOptions::default())
        .expect("mutation")
        .await
        .expect("fulfilled");

    engine.reset();
    assert_eq!(engine.open_cache_entries(), 0);
}
