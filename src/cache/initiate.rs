//! Consumer entry points.
//!
//! Every start emits a pending or skipped action so that subscriptions are
//! recorded, but only the condition rule decides whether a fetch runs. The
//! condition check, the pending dispatch and the running-map insert happen
//! under one lock, so concurrent starts for a key observe each other.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared, join_all};
use futures::FutureExt;
use metrics::counter;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::infra::error::EngineError;
use crate::infra::telemetry::METRIC_QUERY_DEDUP_TOTAL;

use super::endpoint::EndpointKind;
use super::engine::QueryEngine;
use super::events::Action;
use super::fetch::SerializedError;
use super::keys::{CacheKey, RequestId};
use super::orchestrator::{Condition, Request, condition, execute_mutation, execute_query};
use super::payload::Payload;
use super::state::{MutationResult, QueryResult, QueryStatus, RefetchPolicy, SubscriptionOptions};

type QueryTask = Shared<BoxFuture<'static, ()>>;
type MutationTask = Shared<BoxFuture<'static, Result<Payload, Payload>>>;

#[derive(Debug, Clone)]
pub struct StartQueryOptions {
    pub subscribe: bool,
    /// Overrides the engine-wide `refetch_on_mount_or_arg_change` policy.
    pub force_refetch: Option<RefetchPolicy>,
    pub subscription: SubscriptionOptions,
}

impl Default for StartQueryOptions {
    fn default() -> Self {
        Self {
            subscribe: true,
            force_refetch: None,
            subscription: SubscriptionOptions::default(),
        }
    }
}

impl StartQueryOptions {
    pub fn unsubscribed() -> Self {
        Self {
            subscribe: false,
            ..Self::default()
        }
    }

    pub fn force_refetch(mut self, policy: impl Into<RefetchPolicy>) -> Self {
        self.force_refetch = Some(policy.into());
        self
    }

    pub fn subscription(mut self, options: SubscriptionOptions) -> Self {
        self.subscription = options;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.subscription.polling_interval = Some(interval);
        self
    }
}

#[derive(Debug, Clone)]
pub struct MutationOptions {
    /// Store the mutation entry in state.
    pub track: bool,
    /// Shared alias; a later mutation under the same alias supersedes this one.
    pub fixed_cache_key: Option<String>,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self {
            track: true,
            fixed_cache_key: None,
        }
    }
}

impl MutationOptions {
    pub fn untracked() -> Self {
        Self {
            track: false,
            ..Self::default()
        }
    }

    pub fn fixed_cache_key(mut self, key: impl Into<String>) -> Self {
        self.fixed_cache_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrefetchOptions {
    pub force: bool,
    pub if_older_than: Option<Duration>,
}

impl PrefetchOptions {
    fn policy(self) -> RefetchPolicy {
        if self.force {
            RefetchPolicy::Always
        } else if let Some(max_age) = self.if_older_than {
            RefetchPolicy::IfOlderThan(max_age)
        } else {
            RefetchPolicy::Never
        }
    }
}

#[derive(Clone)]
struct RunningQuery {
    request_id: RequestId,
    endpoint: String,
    args: Payload,
    task: QueryTask,
    signal: CancellationToken,
}

#[derive(Clone)]
struct RunningMutation {
    request_id: RequestId,
    endpoint: String,
    args: Payload,
    mutation_key: CacheKey,
    tracked: bool,
    task: MutationTask,
    signal: CancellationToken,
}

/// In-flight requests owned by one engine.
#[derive(Default)]
pub(crate) struct RunningOperations {
    queries: DashMap<CacheKey, RunningQuery>,
    /// Keyed by request id, and by the fixed cache key when one is set.
    mutations: DashMap<String, RunningMutation>,
}

impl RunningOperations {
    pub(crate) fn finish_query(&self, cache_key: &CacheKey, request_id: RequestId) {
        self.queries
            .remove_if(cache_key, |_, running| running.request_id == request_id);
    }

    pub(crate) fn finish_mutation(&self, request_id: RequestId, alias: Option<&str>) {
        self.mutations.remove(&request_id.to_string());
        if let Some(alias) = alias {
            self.mutations
                .remove_if(alias, |_, running| running.request_id == request_id);
        }
    }

    fn query_task(&self, cache_key: &CacheKey) -> Option<QueryTask> {
        self.queries.get(cache_key).map(|running| running.task.clone())
    }
}

/// Consumer handle of a query start.
///
/// Awaiting the handle yields the entry once this call's request (or the
/// request it joined) has settled.
#[derive(Clone)]
pub struct QueryHandle {
    engine: QueryEngine,
    endpoint: String,
    args: Payload,
    cache_key: CacheKey,
    request_id: RequestId,
    subscribed: bool,
    task: Option<QueryTask>,
    signal: Option<CancellationToken>,
}

impl QueryHandle {
    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn args(&self) -> &Payload {
        &self.args
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn settled(&self) -> QueryResult {
        if let Some(task) = self.task.clone() {
            task.await;
        }
        self.engine.select_query_by_key(&self.cache_key)
    }

    /// Settled data, or the error value of a rejected entry.
    pub async fn unwrap(&self) -> Result<Payload, Payload> {
        let result = self.settled().await;
        if result.status == QueryStatus::Rejected {
            return Err(result.error.unwrap_or_default());
        }
        result.data.ok_or_else(|| {
            SerializedError::new("Uninitialized", "cache entry holds no data").into_payload()
        })
    }

    /// Signal the fetch collaborator to stop. A no-op for starts that did not
    /// execute a fetch themselves.
    pub fn abort(&self) {
        if let Some(signal) = &self.signal {
            debug!(cache_key = %self.cache_key, request_id = %self.request_id, "Aborting query");
            signal.cancel();
        }
    }

    /// Start a forced, unsubscribed refetch of the same arguments.
    pub fn refetch(&self) -> Result<QueryHandle, EngineError> {
        self.engine.start_query(
            &self.endpoint,
            self.args.clone(),
            StartQueryOptions::unsubscribed().force_refetch(RefetchPolicy::Always),
        )
    }

    /// Remove this consumer's subscription, if it subscribed.
    pub fn unsubscribe(&self) {
        if !self.subscribed {
            return;
        }
        self.engine.dispatch(Action::Unsubscribe {
            cache_key: self.cache_key.clone(),
            request_id: self.request_id,
        });
    }

    pub fn update_subscription_options(&self, options: SubscriptionOptions) {
        if !self.subscribed {
            return;
        }
        self.engine.dispatch(Action::UpdateSubscriptionOptions {
            cache_key: self.cache_key.clone(),
            request_id: self.request_id,
            options,
        });
    }
}

impl IntoFuture for QueryHandle {
    type Output = QueryResult;
    type IntoFuture = BoxFuture<'static, QueryResult>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.settled().await }.boxed()
    }
}

/// Consumer handle of a mutation.
#[derive(Clone)]
pub struct MutationHandle {
    engine: QueryEngine,
    endpoint: String,
    args: Payload,
    mutation_key: CacheKey,
    request_id: RequestId,
    tracked: bool,
    task: MutationTask,
    signal: CancellationToken,
}

impl MutationHandle {
    fn from_running(engine: &QueryEngine, running: RunningMutation) -> Self {
        Self {
            engine: engine.clone(),
            endpoint: running.endpoint,
            args: running.args,
            mutation_key: running.mutation_key,
            request_id: running.request_id,
            tracked: running.tracked,
            task: running.task,
            signal: running.signal,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Key of the mutation entry: the fixed cache key or the request id.
    pub fn mutation_key(&self) -> &CacheKey {
        &self.mutation_key
    }

    pub fn args(&self) -> &Payload {
        &self.args
    }

    pub async fn settled(&self) -> MutationResult {
        let outcome = self.task.clone().await;
        if self.tracked {
            let stored = self.engine.select_mutation(self.mutation_key.as_str());
            if stored.request_id == Some(self.request_id) {
                return stored;
            }
        }
        let (status, data, error) = match outcome {
            Ok(data) => (QueryStatus::Fulfilled, Some(data), None),
            Err(error) => (QueryStatus::Rejected, None, Some(error)),
        };
        MutationResult {
            status,
            endpoint: Some(self.endpoint.clone()),
            request_id: Some(self.request_id),
            data,
            error,
            started_at: None,
            fulfilled_at: None,
        }
    }

    /// Resolves with the data, or fails with the error value.
    pub async fn unwrap(&self) -> Result<Payload, Payload> {
        self.task.clone().await
    }

    pub fn abort(&self) {
        debug!(mutation_key = %self.mutation_key, request_id = %self.request_id, "Aborting mutation");
        self.signal.cancel();
    }

    /// Remove the tracked entry, unless a later mutation took over its key.
    pub fn reset(&self) {
        if !self.tracked {
            return;
        }
        self.engine.dispatch(Action::RemoveMutationResult {
            mutation_key: self.mutation_key.clone(),
            request_id: Some(self.request_id),
        });
    }
}

impl IntoFuture for MutationHandle {
    type Output = Result<Payload, Payload>;
    type IntoFuture = BoxFuture<'static, Result<Payload, Payload>>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.unwrap().await }.boxed()
    }
}

/// A request still in flight.
pub enum RunningOperation {
    Query(QueryHandle),
    Mutation(MutationHandle),
}

impl RunningOperation {
    pub fn request_id(&self) -> RequestId {
        match self {
            RunningOperation::Query(handle) => handle.request_id(),
            RunningOperation::Mutation(handle) => handle.request_id(),
        }
    }
}

impl QueryEngine {
    /// Start (or join) a query.
    pub fn start_query(
        &self,
        endpoint: &str,
        args: impl Into<Payload>,
        options: StartQueryOptions,
    ) -> Result<QueryHandle, EngineError> {
        let args = args.into();
        let definition = Arc::clone(self.api().expect(endpoint, EndpointKind::Query)?);
        let cache_key = definition.cache_key(endpoint, &args);
        let request_id = RequestId::new();
        self.warn_if_inert();

        let mut handle = QueryHandle {
            engine: self.clone(),
            endpoint: endpoint.to_string(),
            args: args.clone(),
            cache_key: cache_key.clone(),
            request_id,
            subscribed: options.subscribe,
            task: None,
            signal: None,
        };

        let _initiate = self.initiate_lock();
        let decision = self.with_state(|state| {
            let policy = options
                .force_refetch
                .unwrap_or(state.config().refetch_on_mount_or_arg_change);
            condition(state.query(&cache_key), &definition, &args, policy, Instant::now())
        });

        match decision {
            Condition::Execute { forced } => {
                debug!(endpoint, cache_key = %cache_key, request_id = %request_id, forced, "Starting query");
                self.dispatch(Action::QueryPending {
                    cache_key: cache_key.clone(),
                    endpoint: endpoint.to_string(),
                    args: args.clone(),
                    request_id,
                    subscribe: options.subscribe,
                    options: options.subscription.clone(),
                    forced,
                    started_at: OffsetDateTime::now_utc(),
                });

                let signal = CancellationToken::new();
                let request = Request {
                    key: cache_key.clone(),
                    endpoint: endpoint.to_string(),
                    kind: EndpointKind::Query,
                    args: args.clone(),
                    request_id,
                    forced,
                    definition,
                };
                let task = execute_query(self.downgrade(), request, signal.clone())
                    .boxed()
                    .shared();
                self.running().queries.insert(
                    cache_key.clone(),
                    RunningQuery {
                        request_id,
                        endpoint: endpoint.to_string(),
                        args,
                        task: task.clone(),
                        signal: signal.clone(),
                    },
                );
                self.runtime().spawn(task.clone());
                handle.task = Some(task);
                handle.signal = Some(signal);
            }
            Condition::InFlight => {
                counter!(METRIC_QUERY_DEDUP_TOTAL).increment(1);
                debug!(endpoint, cache_key = %cache_key, "Joining in-flight query");
                handle.task = self.running().query_task(&cache_key);
                self.skip(&cache_key, request_id, &options);
            }
            Condition::Cached => {
                debug!(endpoint, cache_key = %cache_key, "Serving cached query");
                self.skip(&cache_key, request_id, &options);
            }
        }

        Ok(handle)
    }

    fn skip(&self, cache_key: &CacheKey, request_id: RequestId, options: &StartQueryOptions) {
        self.dispatch(Action::QuerySkipped {
            cache_key: cache_key.clone(),
            request_id,
            subscribe: options.subscribe,
            options: options.subscription.clone(),
        });
    }

    /// Start a mutation. Mutations always execute.
    pub fn start_mutation(
        &self,
        endpoint: &str,
        args: impl Into<Payload>,
        options: MutationOptions,
    ) -> Result<MutationHandle, EngineError> {
        let args = args.into();
        let definition = Arc::clone(self.api().expect(endpoint, EndpointKind::Mutation)?);
        let request_id = RequestId::new();
        let mutation_key = match &options.fixed_cache_key {
            Some(alias) => CacheKey::new(alias.as_str()),
            None => CacheKey::new(request_id.to_string()),
        };
        self.warn_if_inert();

        debug!(endpoint, mutation_key = %mutation_key, request_id = %request_id, "Starting mutation");
        self.dispatch(Action::MutationPending {
            mutation_key: mutation_key.clone(),
            endpoint: endpoint.to_string(),
            args: args.clone(),
            request_id,
            track: options.track,
            started_at: OffsetDateTime::now_utc(),
        });

        let signal = CancellationToken::new();
        let request = Request {
            key: mutation_key.clone(),
            endpoint: endpoint.to_string(),
            kind: EndpointKind::Mutation,
            args: args.clone(),
            request_id,
            forced: false,
            definition,
        };
        let task = execute_mutation(
            self.downgrade(),
            request,
            signal.clone(),
            options.fixed_cache_key.clone(),
        )
        .boxed()
        .shared();

        let running = RunningMutation {
            request_id,
            endpoint: endpoint.to_string(),
            args,
            mutation_key,
            tracked: options.track,
            task: task.clone(),
            signal,
        };
        if let Some(alias) = &options.fixed_cache_key {
            self.running().mutations.insert(alias.clone(), running.clone());
        }
        self.running()
            .mutations
            .insert(request_id.to_string(), running.clone());
        self.runtime().spawn(task);

        Ok(MutationHandle::from_running(self, running))
    }

    /// Warm the cache without subscribing.
    pub fn prefetch(
        &self,
        endpoint: &str,
        args: impl Into<Payload>,
        options: PrefetchOptions,
    ) -> Result<QueryHandle, EngineError> {
        self.start_query(
            endpoint,
            args,
            StartQueryOptions::unsubscribed().force_refetch(options.policy()),
        )
    }

    /// Forced, unsubscribed refetch used by invalidation, polling and
    /// environment refresh.
    pub(crate) fn refetch_entry(&self, endpoint: &str, args: Payload) -> Result<QueryHandle, EngineError> {
        self.start_query(
            endpoint,
            args,
            StartQueryOptions::unsubscribed().force_refetch(RefetchPolicy::Always),
        )
    }

    /// The in-flight query for `(endpoint, args)`, if any.
    pub fn get_running_query(
        &self,
        endpoint: &str,
        args: impl Into<Payload>,
    ) -> Result<Option<QueryHandle>, EngineError> {
        let cache_key = self.cache_key(endpoint, args)?;
        let handle = self.running().queries.get(&cache_key).map(|running| QueryHandle {
            engine: self.clone(),
            endpoint: running.endpoint.clone(),
            args: running.args.clone(),
            cache_key: cache_key.clone(),
            request_id: running.request_id,
            subscribed: false,
            task: Some(running.task.clone()),
            signal: Some(running.signal.clone()),
        });
        Ok(handle)
    }

    /// The in-flight mutation with this request id or fixed cache key.
    pub fn get_running_mutation(&self, key: &str) -> Option<MutationHandle> {
        let running = self.running().mutations.get(key).map(|running| running.value().clone())?;
        Some(MutationHandle::from_running(self, running))
    }

    pub fn running_operations(&self) -> Vec<RunningOperation> {
        let queries: Vec<RunningOperation> = self
            .running()
            .queries
            .iter()
            .map(|item| {
                let running = item.value();
                RunningOperation::Query(QueryHandle {
                    engine: self.clone(),
                    endpoint: running.endpoint.clone(),
                    args: running.args.clone(),
                    cache_key: item.key().clone(),
                    request_id: running.request_id,
                    subscribed: false,
                    task: Some(running.task.clone()),
                    signal: Some(running.signal.clone()),
                })
            })
            .collect();

        let mut mutations: Vec<RunningMutation> = Vec::new();
        for item in self.running().mutations.iter() {
            if !mutations
                .iter()
                .any(|seen| seen.request_id == item.value().request_id)
            {
                mutations.push(item.value().clone());
            }
        }

        queries
            .into_iter()
            .chain(
                mutations
                    .into_iter()
                    .map(|running| RunningOperation::Mutation(MutationHandle::from_running(self, running))),
            )
            .collect()
    }

    /// Wait until every request in flight at call time has settled.
    pub async fn settle_running(&self) {
        let operations = self.running_operations();
        join_all(operations.into_iter().map(|operation| async move {
            match operation {
                RunningOperation::Query(handle) => {
                    handle.settled().await;
                }
                RunningOperation::Mutation(handle) => {
                    let _ = handle.unwrap().await;
                }
            }
        }))
        .await;
    }
}
