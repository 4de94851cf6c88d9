//! The query engine.
//!
//! All state lives in one [`ApiState`] behind a lock. [`QueryEngine::dispatch`]
//! applies an action, releases the lock and then runs the listeners in a fixed
//! order: lifecycle bridges, cache collection, invalidation, polling and
//! environment refresh. Listeners never write state directly; they dispatch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheSettings;
use crate::infra::error::EngineError;
use crate::infra::telemetry::{self, METRIC_CACHE_EVICT_TOTAL, METRIC_STALE_RESPONSE_TOTAL};

use super::collector::Collector;
use super::endpoint::{Api, EndpointKind};
use super::environment::{self, EnvironmentSignal};
use super::events::{Action, Epoch};
use super::initiate::RunningOperations;
use super::invalidation::Invalidator;
use super::keys::{CacheKey, RequestId};
use super::lifecycle::Lifecycles;
use super::lock::{mutex_lock, rw_read, rw_write};
use super::payload::Payload;
use super::persist::Snapshot;
use super::polling::Poller;
use super::state::{
    ApiState, Applied, ConfigState, InvalidationBehavior, MAX_TIMER_DELAY, MutationResult,
    QueryResult, RefetchPolicy,
};
use super::tags::{Tag, TagInput};

const SOURCE: &str = "cache::engine";

struct EngineInner {
    api: Api,
    state: RwLock<ApiState>,
    runtime: Handle,
    epoch: AtomicU64,
    missing_middleware_warned: AtomicBool,
    initiate: Mutex<()>,
    running: RunningOperations,
    collector: Collector,
    poller: Poller,
    invalidator: Invalidator,
    lifecycles: Lifecycles,
}

/// Keyed async query and mutation cache.
///
/// Cheap to clone; clones share one state.
#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<EngineInner>,
}

/// Non-owning reference held by timers and listener tasks.
#[derive(Clone)]
pub struct WeakEngine {
    inner: Weak<EngineInner>,
}

impl WeakEngine {
    pub fn upgrade(&self) -> Option<QueryEngine> {
        self.inner.upgrade().map(|inner| QueryEngine { inner })
    }
}

pub struct EngineBuilder {
    api: Api,
    config: ConfigState,
    middleware: bool,
    snapshot: Option<Snapshot>,
}

impl EngineBuilder {
    pub fn new(api: Api) -> Self {
        Self {
            api,
            config: ConfigState::default(),
            middleware: true,
            snapshot: None,
        }
    }

    /// Apply loaded cache settings.
    pub fn settings(mut self, settings: &CacheSettings) -> Self {
        self.config.keep_unused_data_for = settings.keep_unused_data_for;
        self.config.refetch_on_mount_or_arg_change = settings.refetch_on_mount_or_arg_change;
        self.config.refetch_on_focus = settings.refetch_on_focus;
        self.config.refetch_on_reconnect = settings.refetch_on_reconnect;
        self.config.invalidation_behavior = settings.invalidation_behavior;
        self.config.max_timer_delay = settings.max_timer_delay.min(MAX_TIMER_DELAY);
        self
    }

    pub fn keep_unused_data_for(mut self, ttl: Duration) -> Self {
        self.config.keep_unused_data_for = ttl;
        self
    }

    pub fn refetch_on_mount_or_arg_change(mut self, policy: impl Into<RefetchPolicy>) -> Self {
        self.config.refetch_on_mount_or_arg_change = policy.into();
        self
    }

    pub fn refetch_on_focus(mut self, enabled: bool) -> Self {
        self.config.refetch_on_focus = enabled;
        self
    }

    pub fn refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.config.refetch_on_reconnect = enabled;
        self
    }

    pub fn invalidation_behavior(mut self, behavior: InvalidationBehavior) -> Self {
        self.config.invalidation_behavior = behavior;
        self
    }

    /// Ceiling for collection and polling timers, capped at [`MAX_TIMER_DELAY`].
    pub fn max_timer_delay(mut self, max: Duration) -> Self {
        self.config.max_timer_delay = max.min(MAX_TIMER_DELAY);
        self
    }

    /// Build a reducer-only engine: no collection, invalidation, polling,
    /// environment refresh or lifecycle hooks.
    pub fn without_middleware(mut self) -> Self {
        self.middleware = false;
        self
    }

    /// Restore terminal entries from a previous [`QueryEngine::snapshot`].
    pub fn rehydrate(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Build the engine on the current Tokio runtime.
    pub fn build(self) -> Result<QueryEngine, EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        telemetry::describe_metrics();

        let mut config = self.config;
        config.middleware_registered = false;
        let engine = QueryEngine {
            inner: Arc::new(EngineInner {
                api: self.api,
                state: RwLock::new(ApiState::new(config)),
                epoch: AtomicU64::new(0),
                missing_middleware_warned: AtomicBool::new(false),
                initiate: Mutex::new(()),
                running: RunningOperations::default(),
                collector: Collector::new(runtime.clone()),
                poller: Poller::new(runtime.clone()),
                invalidator: Invalidator::default(),
                lifecycles: Lifecycles::default(),
                runtime,
            }),
        };

        if self.middleware {
            engine.dispatch(Action::MiddlewareRegistered);
        }
        if let Some(snapshot) = self.snapshot {
            let restored = snapshot.queries.len();
            engine.dispatch(Action::Rehydrate {
                snapshot: Box::new(snapshot),
                restored_at: OffsetDateTime::now_utc(),
                restored_instant: Instant::now(),
            });
            debug!(restored, "Rehydrated query engine");
        }
        Ok(engine)
    }
}

impl QueryEngine {
    pub fn builder(api: Api) -> EngineBuilder {
        EngineBuilder::new(api)
    }

    /// Apply `action` and run the listeners.
    pub fn dispatch(&self, action: Action) -> Applied {
        let (applied, middleware) = {
            let mut state = rw_write(&self.inner.state, SOURCE, action.name());
            let applied = state.apply(&action, &self.inner.api);
            (applied, state.config().middleware_registered)
        };
        let epoch = self.inner.epoch.fetch_add(1, Ordering::Relaxed) + 1;

        if applied.stale {
            counter!(METRIC_STALE_RESPONSE_TOTAL).increment(1);
            debug!(
                action = action.name(),
                cache_key = ?action.cache_key().map(CacheKey::as_str),
                "Dropped settlement of superseded request"
            );
        } else {
            debug!(
                action = action.name(),
                epoch,
                cache_key = ?action.cache_key().map(CacheKey::as_str),
                changed = applied.changed,
                "Applied action"
            );
        }

        if middleware {
            self.inner.lifecycles.on_action(self, &action, &applied);
            self.inner.collector.on_action(self, &action, &applied);
            self.inner.invalidator.on_action(self, &action, &applied);
            self.inner.poller.on_action(self, &action, &applied);
            environment::on_action(self, &action, &applied);
        }
        applied
    }

    /// Read the state under the lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&ApiState) -> R) -> R {
        let state = rw_read(&self.inner.state, SOURCE, "with_state");
        f(&state)
    }

    pub fn api(&self) -> &Api {
        &self.inner.api
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of actions applied so far.
    pub fn epoch(&self) -> Epoch {
        self.inner.epoch.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> ConfigState {
        self.with_state(|state| state.config().clone())
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub(crate) fn poller(&self) -> &Poller {
        &self.inner.poller
    }

    pub(crate) fn running(&self) -> &RunningOperations {
        &self.inner.running
    }

    pub(crate) fn initiate_lock(&self) -> MutexGuard<'_, ()> {
        mutex_lock(&self.inner.initiate, SOURCE, "initiate")
    }

    /// Warn once when starts are issued against an engine without middleware.
    pub(crate) fn warn_if_inert(&self) {
        if self.with_state(|state| state.config().middleware_registered) {
            return;
        }
        if !self.inner.missing_middleware_warned.swap(true, Ordering::Relaxed) {
            warn!(
                "Query engine was built without middleware; cache collection, invalidation, \
                 polling and lifecycle hooks are inactive"
            );
        }
    }

    /// Cache key of a query endpoint call.
    pub fn cache_key(&self, endpoint: &str, args: impl Into<Payload>) -> Result<CacheKey, EngineError> {
        let args = args.into();
        let definition = self.api().expect(endpoint, EndpointKind::Query)?;
        Ok(definition.cache_key(endpoint, &args))
    }

    pub fn select_query(&self, endpoint: &str, args: impl Into<Payload>) -> Result<QueryResult, EngineError> {
        let cache_key = self.cache_key(endpoint, args)?;
        Ok(self.select_query_by_key(&cache_key))
    }

    pub fn select_query_by_key(&self, cache_key: &CacheKey) -> QueryResult {
        self.with_state(|state| QueryResult::from_entry(cache_key, state.query(cache_key)))
    }

    /// Mutation entry by request id or fixed cache key.
    pub fn select_mutation(&self, mutation_key: &str) -> MutationResult {
        self.with_state(|state| MutationResult::from_entry(state.mutation(&CacheKey::from(mutation_key))))
    }

    /// Write fulfilled data without a network call.
    pub fn upsert_query_data(
        &self,
        endpoint: &str,
        args: impl Into<Payload>,
        data: impl Into<Payload>,
    ) -> Result<QueryResult, EngineError> {
        let args = args.into();
        let data = data.into();
        let definition = self.api().expect(endpoint, EndpointKind::Query)?;
        let cache_key = definition.cache_key(endpoint, &args);
        let provided_tags = definition.provided_tags(TagInput {
            result: Some(&data),
            error: None,
            args: &args,
        });

        self.dispatch(Action::QueryUpserted {
            cache_key: cache_key.clone(),
            endpoint: endpoint.to_string(),
            args,
            request_id: RequestId::new(),
            data,
            provided_tags,
            fulfilled_at: OffsetDateTime::now_utc(),
            received_at: Instant::now(),
        });
        Ok(self.select_query_by_key(&cache_key))
    }

    /// Patch the cached data of an entry that holds data. Provided tags are
    /// kept. Returns whether a patch was applied.
    pub fn update_query_data<F>(&self, endpoint: &str, args: impl Into<Payload>, f: F) -> Result<bool, EngineError>
    where
        F: FnOnce(&Payload) -> Payload,
    {
        let cache_key = self.cache_key(endpoint, args)?;
        let current = self.with_state(|state| {
            let data = state.query(&cache_key)?.data.clone()?;
            Some((data, state.provided().tags_for_key(&cache_key)))
        });
        let Some((data, provided_tags)) = current else {
            return Ok(false);
        };

        let applied = self.dispatch(Action::QueryDataPatched {
            cache_key,
            data: f(&data),
            provided_tags,
        });
        Ok(applied.changed)
    }

    /// Remove a query entry. Returns whether an entry existed.
    pub fn remove_query(&self, endpoint: &str, args: impl Into<Payload>) -> Result<bool, EngineError> {
        let cache_key = self.cache_key(endpoint, args)?;
        let applied = self.dispatch(Action::RemoveQueryResult { cache_key });
        if applied.removed {
            counter!(METRIC_CACHE_EVICT_TOTAL, "reason" => "removed").increment(1);
        }
        Ok(applied.removed)
    }

    pub fn invalidate_tags(&self, tags: impl IntoIterator<Item = Tag>) {
        self.dispatch(Action::InvalidateTags {
            tags: tags.into_iter().collect(),
        });
    }

    /// Drop every query, mutation, subscription and index entry. Config is kept.
    pub fn reset(&self) {
        self.dispatch(Action::ResetApiState);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.with_state(Snapshot::capture)
    }

    pub fn set_focused(&self, focused: bool) {
        self.dispatch(Action::SetFocused(focused));
    }

    pub fn set_online(&self, online: bool) {
        self.dispatch(Action::SetOnline(online));
    }

    pub fn signal(&self, signal: EnvironmentSignal) {
        match signal {
            EnvironmentSignal::Focused => self.set_focused(true),
            EnvironmentSignal::Unfocused => self.set_focused(false),
            EnvironmentSignal::Online => self.set_online(true),
            EnvironmentSignal::Offline => self.set_online(false),
        }
    }

    pub fn subscriber_count(&self, cache_key: &CacheKey) -> usize {
        self.with_state(|state| state.subscriber_count(cache_key))
    }

    /// Deadline of the armed poll for `cache_key`.
    pub fn next_poll(&self, cache_key: &CacheKey) -> Option<Instant> {
        self.inner.poller.next_poll(cache_key)
    }

    /// Number of armed cache-collection timers.
    pub fn pending_collections(&self) -> usize {
        self.inner.collector.scheduled()
    }

    /// Number of cache-entry lifecycle bridges still open.
    pub fn open_cache_entries(&self) -> usize {
        self.inner.lifecycles.open_entries()
    }

    /// Number of tags held back by delayed invalidation.
    pub fn held_invalidations(&self) -> usize {
        self.inner.invalidator.held()
    }
}
