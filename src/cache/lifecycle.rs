//! Lifecycle bridges.
//!
//! Two one-shot channels are opened when a request goes pending:
//!
//! - a per-call [`Settlement`] handed to `on_query_started` hooks, resolved
//!   with this request's own outcome;
//! - a per-entry pair (`data_loaded`, `entry_removed`) handed to
//!   `on_cache_entry_added` hooks. `data_loaded` resolves with the first value
//!   the entry ever receives, or fails with [`LifecycleError::NeverResolved`]
//!   if the entry is removed first.
//!
//! Dropping either receiver is harmless; senders ignore closed channels.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::infra::error::LifecycleError;

use super::endpoint::{EndpointDefinition, EndpointKind};
use super::engine::QueryEngine;
use super::events::Action;
use super::keys::{CacheKey, RequestId};
use super::payload::Payload;
use super::state::Applied;

type Outcome = Result<Payload, LifecycleError>;

/// Resolves once with a request or entry outcome.
#[derive(Debug)]
pub struct Settlement(oneshot::Receiver<Outcome>);

impl Future for Settlement {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(LifecycleError::NeverResolved)))
    }
}

/// Resolves when the cache entry is removed (or the engine is dropped).
#[derive(Debug)]
pub struct EntryRemoved(oneshot::Receiver<()>);

impl Future for EntryRemoved {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|_| ())
    }
}

/// Handed to `on_query_started` hooks.
pub struct QueryStartedContext {
    pub endpoint: String,
    pub kind: EndpointKind,
    pub args: Payload,
    pub request_id: RequestId,
    /// Query cache key, or the mutation's entry key.
    pub cache_key: CacheKey,
    /// This request's outcome.
    pub fulfilled: Settlement,
    pub engine: QueryEngine,
}

/// Handed to `on_cache_entry_added` hooks.
pub struct CacheEntryContext {
    pub endpoint: String,
    pub kind: EndpointKind,
    pub args: Payload,
    pub request_id: RequestId,
    pub cache_key: CacheKey,
    pub data_loaded: Settlement,
    pub entry_removed: EntryRemoved,
    pub engine: QueryEngine,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EntryId {
    Query(CacheKey),
    Mutation(CacheKey),
}

struct EntryBridge {
    data_loaded: Option<oneshot::Sender<Outcome>>,
    removed: oneshot::Sender<()>,
}

#[derive(Default)]
pub(crate) struct Lifecycles {
    calls: DashMap<RequestId, oneshot::Sender<Outcome>>,
    entries: DashMap<EntryId, EntryBridge>,
}

struct Started<'a> {
    definition: &'a EndpointDefinition,
    endpoint: &'a str,
    kind: EndpointKind,
    args: &'a Payload,
    request_id: RequestId,
    cache_key: &'a CacheKey,
}

impl Lifecycles {
    pub(crate) fn on_action(&self, engine: &QueryEngine, action: &Action, applied: &Applied) {
        match action {
            Action::QueryPending {
                cache_key,
                endpoint,
                args,
                request_id,
                ..
            } => {
                let Ok(definition) = engine.api().endpoint(endpoint) else {
                    return;
                };
                let started = Started {
                    definition,
                    endpoint,
                    kind: EndpointKind::Query,
                    args,
                    request_id: *request_id,
                    cache_key,
                };
                if applied.created {
                    self.open_entry(engine, EntryId::Query(cache_key.clone()), &started);
                }
                self.open_call(engine, &started);
            }
            Action::QueryUpserted {
                cache_key,
                endpoint,
                args,
                request_id,
                ..
            } => {
                let entry = EntryId::Query(cache_key.clone());
                if applied.created {
                    if let Ok(definition) = engine.api().endpoint(endpoint) {
                        let started = Started {
                            definition,
                            endpoint,
                            kind: EndpointKind::Query,
                            args,
                            request_id: *request_id,
                            cache_key,
                        };
                        self.open_entry(engine, entry.clone(), &started);
                    }
                }
                if let Some(data) = engine.select_query_by_key(cache_key).data {
                    self.resolve_entry(&entry, data);
                }
            }
            Action::QueryFulfilled {
                cache_key,
                request_id,
                data,
                ..
            } => {
                self.settle_call(request_id, Ok(data.clone()));
                if applied.changed {
                    if let Some(data) = engine.select_query_by_key(cache_key).data {
                        self.resolve_entry(&EntryId::Query(cache_key.clone()), data);
                    }
                }
            }
            Action::QueryRejected {
                request_id, error, ..
            }
            | Action::MutationRejected {
                request_id, error, ..
            } => {
                self.settle_call(
                    request_id,
                    Err(LifecycleError::Rejected {
                        error: error.clone(),
                    }),
                );
            }
            Action::RemoveQueryResult { cache_key } if applied.removed => {
                self.close_entry(&EntryId::Query(cache_key.clone()));
            }
            Action::MutationPending {
                mutation_key,
                endpoint,
                args,
                request_id,
                ..
            } => {
                let Ok(definition) = engine.api().endpoint(endpoint) else {
                    return;
                };
                let started = Started {
                    definition,
                    endpoint,
                    kind: EndpointKind::Mutation,
                    args,
                    request_id: *request_id,
                    cache_key: mutation_key,
                };
                if applied.created {
                    let entry = EntryId::Mutation(mutation_key.clone());
                    // a fixed cache key replaces the previous entry
                    self.close_entry(&entry);
                    self.open_entry(engine, entry, &started);
                }
                self.open_call(engine, &started);
            }
            Action::MutationFulfilled {
                mutation_key,
                request_id,
                data,
                ..
            } => {
                self.settle_call(request_id, Ok(data.clone()));
                if applied.changed {
                    self.resolve_entry(&EntryId::Mutation(mutation_key.clone()), data.clone());
                }
            }
            Action::RemoveMutationResult { mutation_key, .. } if applied.removed => {
                self.close_entry(&EntryId::Mutation(mutation_key.clone()));
            }
            Action::ResetApiState => self.close_all(),
            _ => {}
        }
    }

    fn open_call(&self, engine: &QueryEngine, started: &Started<'_>) {
        let Some(hook) = started.definition.query_started_hook() else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        self.calls.insert(started.request_id, tx);
        let context = QueryStartedContext {
            endpoint: started.endpoint.to_string(),
            kind: started.kind,
            args: started.args.clone(),
            request_id: started.request_id,
            cache_key: started.cache_key.clone(),
            fulfilled: Settlement(rx),
            engine: engine.clone(),
        };
        engine.runtime().spawn(hook(context));
    }

    fn open_entry(&self, engine: &QueryEngine, entry: EntryId, started: &Started<'_>) {
        let Some(hook) = started.definition.cache_entry_hook() else {
            return;
        };
        let (loaded_tx, loaded_rx) = oneshot::channel();
        let (removed_tx, removed_rx) = oneshot::channel();
        self.entries.insert(
            entry.clone(),
            EntryBridge {
                data_loaded: Some(loaded_tx),
                removed: removed_tx,
            },
        );
        // A removal dispatched after the state lock was released may already
        // have run its listeners; it cannot see this bridge.
        if !entry_exists(engine, &entry) {
            self.close_entry(&entry);
        }
        debug!(
            endpoint = started.endpoint,
            cache_key = %started.cache_key,
            "Cache entry added"
        );
        let context = CacheEntryContext {
            endpoint: started.endpoint.to_string(),
            kind: started.kind,
            args: started.args.clone(),
            request_id: started.request_id,
            cache_key: started.cache_key.clone(),
            data_loaded: Settlement(loaded_rx),
            entry_removed: EntryRemoved(removed_rx),
            engine: engine.clone(),
        };
        engine.runtime().spawn(hook(context));
    }

    fn settle_call(&self, request_id: &RequestId, outcome: Outcome) {
        if let Some((_, tx)) = self.calls.remove(request_id) {
            let _ = tx.send(outcome);
        }
    }

    fn resolve_entry(&self, entry: &EntryId, data: Payload) {
        if let Some(mut bridge) = self.entries.get_mut(entry) {
            if let Some(tx) = bridge.data_loaded.take() {
                let _ = tx.send(Ok(data));
            }
        }
    }

    fn close_entry(&self, entry: &EntryId) {
        if let Some((_, bridge)) = self.entries.remove(entry) {
            Self::close(bridge);
        }
    }

    fn close_all(&self) {
        let entries: Vec<EntryId> = self.entries.iter().map(|item| item.key().clone()).collect();
        for entry in entries {
            self.close_entry(&entry);
        }
    }

    fn close(bridge: EntryBridge) {
        if let Some(tx) = bridge.data_loaded {
            let _ = tx.send(Err(LifecycleError::NeverResolved));
        }
        let _ = bridge.removed.send(());
    }

    /// Number of open per-entry bridges.
    pub(crate) fn open_entries(&self) -> usize {
        self.entries.len()
    }
}

fn entry_exists(engine: &QueryEngine, entry: &EntryId) -> bool {
    engine.with_state(|state| match entry {
        EntryId::Query(key) => state.query(key).is_some(),
        EntryId::Mutation(key) => state.mutation(key).is_some(),
    })
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;
    use tokio::sync::mpsc;

    use super::*;
    use crate::cache::endpoint::Api;
    use crate::cache::fetch::{FetchContext, FetchResult};
    use crate::cache::state::SubscriptionOptions;

    fn engine(tx: mpsc::UnboundedSender<Outcome>) -> QueryEngine {
        let api = Api::builder()
            .endpoint(
                "getPost",
                EndpointDefinition::query(|args: Payload, _ctx: FetchContext| async move {
                    FetchResult::ok(args)
                })
                .on_cache_entry_added(move |ctx: CacheEntryContext| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(ctx.data_loaded.await);
                        ctx.entry_removed.await;
                    }
                }),
            )
            .build();
        QueryEngine::builder(api).build().expect("engine")
    }

    #[tokio::test]
    async fn entry_removed_before_bridge_opens_is_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = engine(tx);
        let lifecycles = Lifecycles::default();

        // the entry was created and then removed before this listener ran
        let pending = Action::QueryPending {
            cache_key: CacheKey::from("getPost(1)"),
            endpoint: "getPost".to_string(),
            args: Payload::from(1),
            request_id: RequestId::new(),
            subscribe: true,
            options: SubscriptionOptions::default(),
            forced: false,
            started_at: OffsetDateTime::now_utc(),
        };
        let applied = Applied {
            changed: true,
            created: true,
            ..Applied::default()
        };
        lifecycles.on_action(&engine, &pending, &applied);

        assert_eq!(lifecycles.open_entries(), 0);
        assert_eq!(
            rx.recv().await.expect("outcome"),
            Err(LifecycleError::NeverResolved)
        );
    }
}
