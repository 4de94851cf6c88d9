use std::sync::Arc;

use quarry::cache::{
    Api, EndpointDefinition, FetchContext, FetchResult, MutationOptions, Payload, QueryEngine,
    QueryStatus, RunningOperation,
};
use tokio::sync::Notify;

fn engine(gate: Arc<Notify>) -> QueryEngine {
    let api = Api::builder()
        .endpoint(
            "addPost",
            EndpointDefinition::mutation(|args: Payload, _ctx: FetchContext| async move {
                FetchResult::ok(args)
            }),
        )
        .endpoint(
            "slowAdd",
            EndpointDefinition::mutation(move |args: Payload, _ctx: FetchContext| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    FetchResult::ok(args)
                }
            }),
        )
        .endpoint(
            "rejectAdd",
            EndpointDefinition::mutation(|_args: Payload, _ctx: FetchContext| async move {
                FetchResult::err("denied")
            }),
        )
        .build();
    QueryEngine::builder(api).build().expect("engine")
}

#[tokio::test]
async fn tracked_mutation_is_stored_under_request_id() {
    let engine = engine(Arc::new(Notify::new()));
    let handle = engine
        .start_mutation("addPost", "draft", MutationOptions::default())
        .expect("mutation");
    assert_eq!(handle.mutation_key().as_str(), handle.request_id().to_string());

    let result = handle.settled().await;
    assert_eq!(result.status, QueryStatus::Fulfilled);
    assert_eq!(result.data.as_ref().and_then(Payload::as_str), Some("draft"));

    handle.reset();
    assert!(engine.select_mutation(handle.mutation_key().as_str()).is_uninitialized());
}

#[tokio::test]
async fn untracked_mutation_leaves_no_entry() {
    let engine = engine(Arc::new(Notify::new()));
    let handle = engine
        .start_mutation("addPost", "draft", MutationOptions::untracked())
        .expect("mutation");

    let result = handle.settled().await;
    assert!(result.is_success());
    assert!(engine.with_state(|state| state.mutations().next().is_none()));
}

#[tokio::test]
async fn fixed_cache_key_is_shared_by_later_calls() {
    let engine = engine(Arc::new(Notify::new()));
    let first = engine
        .start_mutation("addPost", "one", MutationOptions::default().fixed_cache_key("add"))
        .expect("mutation");
    first.settled().await;
    let second = engine
        .start_mutation("addPost", "two", MutationOptions::default().fixed_cache_key("add"))
        .expect("mutation");
    second.settled().await;

    let stored = engine.select_mutation("add");
    assert_eq!(stored.request_id, Some(second.request_id()));

    // the superseded call must not clear the newer entry
    first.reset();
    assert!(engine.select_mutation("add").is_success());
    second.reset();
    assert!(engine.select_mutation("add").is_uninitialized());
}

#[tokio::test]
async fn rejected_mutation_surfaces_error_value() {
    let engine = engine(Arc::new(Notify::new()));
    let handle = engine
        .start_mutation("rejectAdd", 1, MutationOptions::default())
        .expect("mutation");

    assert_eq!(handle.unwrap().await, Err(Payload::from("denied")));
    let result = handle.settled().await;
    assert!(result.is_error());
}

#[tokio::test]
async fn running_mutation_is_found_by_key_and_alias() {
    let gate = Arc::new(Notify::new());
    let engine = engine(Arc::clone(&gate));
    let handle = engine
        .start_mutation("slowAdd", 1, MutationOptions::default().fixed_cache_key("slow"))
        .expect("mutation");

    let by_id = engine
        .get_running_mutation(&handle.request_id().to_string())
        .expect("by request id");
    let by_alias = engine.get_running_mutation("slow").expect("by alias");
    assert_eq!(by_id.request_id(), handle.request_id());
    assert_eq!(by_alias.request_id(), handle.request_id());

    let operations = engine.running_operations();
    assert_eq!(operations.len(), 1);
    assert!(matches!(operations[0], RunningOperation::Mutation(_)));

    gate.notify_one();
    handle.settled().await;
    assert!(engine.get_running_mutation("slow").is_none());
    assert!(engine.running_operations().is_empty());
}

#[tokio::test]
async fn aborted_mutation_rejects() {
    let engine = engine(Arc::new(Notify::new()));
    let handle = engine
        .start_mutation("slowAdd", 1, MutationOptions::default())
        .expect("mutation");

    handle.abort();
    let error = handle.unwrap().await.expect_err("aborted");
    assert_eq!(error.get("name").and_then(Payload::as_str), Some("AbortError"));
}
