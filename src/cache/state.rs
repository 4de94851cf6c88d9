//! Entry state store.
//!
//! [`ApiState`] holds the four partitions (queries, mutations, subscriptions
//! and the invalidation index) plus [`ConfigState`]. It is only ever mutated
//! through [`ApiState::apply`], called from the engine's dispatch path.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;

use super::endpoint::Api;
use super::events::Action;
use super::keys::{CacheKey, RequestId};
use super::payload::Payload;
use super::persist::Snapshot;
use super::registry::InvalidationIndex;
use super::tags::Tag;

pub const DEFAULT_KEEP_UNUSED_DATA_FOR: Duration = Duration::from_secs(60);
/// Largest delay the timer layer accepts, about 24.8 days.
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(2_147_483_647);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Uninitialized,
    Pending,
    Fulfilled,
    Rejected,
}

impl QueryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueryStatus::Fulfilled | QueryStatus::Rejected)
    }
}

/// When a start call bypasses cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchPolicy {
    #[default]
    Never,
    Always,
    /// Refetch once the cached data is at least this old.
    IfOlderThan(Duration),
}

impl RefetchPolicy {
    pub(crate) fn is_due(self, received_at: Option<Instant>, now: Instant) -> bool {
        match self {
            RefetchPolicy::Never => false,
            RefetchPolicy::Always => true,
            RefetchPolicy::IfOlderThan(max_age) => {
                received_at.is_none_or(|at| now.saturating_duration_since(at) >= max_age)
            }
        }
    }
}

impl From<bool> for RefetchPolicy {
    fn from(value: bool) -> Self {
        if value {
            RefetchPolicy::Always
        } else {
            RefetchPolicy::Never
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationBehavior {
    /// Hold invalidations back while any request is pending.
    #[default]
    Delayed,
    Immediately,
}

/// Per-consumer preferences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub polling_interval: Option<Duration>,
    pub skip_polling_if_unfocused: bool,
    pub refetch_on_focus: Option<bool>,
    pub refetch_on_reconnect: Option<bool>,
}

impl SubscriptionOptions {
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    pub fn skip_polling_if_unfocused(mut self, skip: bool) -> Self {
        self.skip_polling_if_unfocused = skip;
        self
    }

    pub fn refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = Some(enabled);
        self
    }

    pub fn refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = Some(enabled);
        self
    }

    /// Polling interval, with zero treated as "no polling".
    pub(crate) fn active_polling(&self) -> Option<Duration> {
        self.polling_interval.filter(|interval| !interval.is_zero())
    }
}

pub type Subscribers = HashMap<RequestId, SubscriptionOptions>;

/// Process-wide settings and environment flags.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigState {
    pub online: bool,
    pub focused: bool,
    pub middleware_registered: bool,
    pub keep_unused_data_for: Duration,
    pub refetch_on_mount_or_arg_change: RefetchPolicy,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
    pub invalidation_behavior: InvalidationBehavior,
    pub max_timer_delay: Duration,
}

impl Default for ConfigState {
    fn default() -> Self {
        Self {
            online: true,
            focused: true,
            middleware_registered: false,
            keep_unused_data_for: DEFAULT_KEEP_UNUSED_DATA_FOR,
            refetch_on_mount_or_arg_change: RefetchPolicy::Never,
            refetch_on_focus: false,
            refetch_on_reconnect: false,
            invalidation_behavior: InvalidationBehavior::Delayed,
            max_timer_delay: MAX_TIMER_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEntry {
    pub status: QueryStatus,
    pub endpoint: String,
    pub original_args: Payload,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Payload>,
    pub started_at: OffsetDateTime,
    #[serde(default)]
    pub fulfilled_at: Option<OffsetDateTime>,
    #[serde(skip)]
    pub(crate) received_at: Option<Instant>,
}

impl QueryEntry {
    fn new(endpoint: &str, args: &Payload, request_id: RequestId, started_at: OffsetDateTime) -> Self {
        Self {
            status: QueryStatus::Uninitialized,
            endpoint: endpoint.to_string(),
            original_args: args.clone(),
            request_id,
            data: None,
            error: None,
            meta: None,
            started_at,
            fulfilled_at: None,
            received_at: None,
        }
    }

    pub fn has_been_fulfilled(&self) -> bool {
        self.fulfilled_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEntry {
    pub status: QueryStatus,
    pub endpoint: String,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Payload>,
    pub started_at: OffsetDateTime,
    #[serde(default)]
    pub fulfilled_at: Option<OffsetDateTime>,
}

/// What a single [`ApiState::apply`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub changed: bool,
    /// A new query or mutation entry was inserted.
    pub created: bool,
    /// A query or mutation entry was removed.
    pub removed: bool,
    /// The settlement belonged to a superseded request.
    pub stale: bool,
}

impl Applied {
    fn ignored() -> Self {
        Self::default()
    }

    fn changed() -> Self {
        Self {
            changed: true,
            ..Self::default()
        }
    }

    fn created() -> Self {
        Self {
            changed: true,
            created: true,
            ..Self::default()
        }
    }

    fn removed(removed: bool) -> Self {
        Self {
            changed: removed,
            removed,
            ..Self::default()
        }
    }

    fn stale() -> Self {
        Self {
            stale: true,
            ..Self::default()
        }
    }

    fn flag(changed: bool) -> Self {
        Self {
            changed,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiState {
    queries: HashMap<CacheKey, QueryEntry>,
    mutations: HashMap<CacheKey, MutationEntry>,
    subscriptions: HashMap<CacheKey, Subscribers>,
    provided: InvalidationIndex,
    config: ConfigState,
}

impl ApiState {
    pub fn new(config: ConfigState) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn query(&self, cache_key: &CacheKey) -> Option<&QueryEntry> {
        self.queries.get(cache_key)
    }

    pub fn queries(&self) -> impl Iterator<Item = (&CacheKey, &QueryEntry)> {
        self.queries.iter()
    }

    pub fn mutation(&self, mutation_key: &CacheKey) -> Option<&MutationEntry> {
        self.mutations.get(mutation_key)
    }

    pub fn mutations(&self) -> impl Iterator<Item = (&CacheKey, &MutationEntry)> {
        self.mutations.iter()
    }

    pub fn subscribers(&self, cache_key: &CacheKey) -> Option<&Subscribers> {
        self.subscriptions.get(cache_key)
    }

    pub fn subscriber_count(&self, cache_key: &CacheKey) -> usize {
        self.subscriptions.get(cache_key).map_or(0, HashMap::len)
    }

    pub fn provided(&self) -> &InvalidationIndex {
        &self.provided
    }

    pub fn config(&self) -> &ConfigState {
        &self.config
    }

    /// Whether any tracked query or mutation is in flight.
    pub fn has_pending(&self) -> bool {
        self.queries
            .values()
            .any(|entry| entry.status == QueryStatus::Pending)
            || self
                .mutations
                .values()
                .any(|entry| entry.status == QueryStatus::Pending)
    }

    /// Apply one transition.
    pub fn apply(&mut self, action: &Action, api: &Api) -> Applied {
        match action {
            Action::QueryPending {
                cache_key,
                endpoint,
                args,
                request_id,
                subscribe,
                options,
                started_at,
                ..
            } => {
                let created = !self.queries.contains_key(cache_key);
                let entry = self
                    .queries
                    .entry(cache_key.clone())
                    .or_insert_with(|| QueryEntry::new(endpoint, args, *request_id, *started_at));
                entry.status = QueryStatus::Pending;
                entry.request_id = *request_id;
                entry.original_args = args.clone();
                entry.started_at = *started_at;
                if *subscribe {
                    self.subscribe(cache_key, *request_id, options);
                }
                if created {
                    Applied::created()
                } else {
                    Applied::changed()
                }
            }
            Action::QuerySkipped {
                cache_key,
                request_id,
                subscribe,
                options,
            } => {
                if *subscribe {
                    self.subscribe(cache_key, *request_id, options);
                }
                Applied::flag(*subscribe)
            }
            Action::QueryFulfilled {
                cache_key,
                request_id,
                data,
                meta,
                provided_tags,
                fulfilled_at,
                received_at,
            } => {
                let Some(entry) = self.queries.get_mut(cache_key) else {
                    return Applied::ignored();
                };
                if entry.request_id != *request_id {
                    return Applied::stale();
                }
                let merged = match api.endpoint(&entry.endpoint) {
                    Ok(definition) => {
                        definition.merge_data(entry.data.as_ref(), data.clone(), &entry.original_args)
                    }
                    Err(_) => data.clone(),
                };
                entry.status = QueryStatus::Fulfilled;
                entry.data = Some(merged);
                entry.error = None;
                entry.meta = meta.clone();
                entry.fulfilled_at = Some(*fulfilled_at);
                entry.received_at = Some(*received_at);
                self.provided.provide(cache_key, provided_tags);
                Applied::changed()
            }
            Action::QueryRejected {
                cache_key,
                request_id,
                error,
                meta,
                with_value,
                provided_tags,
            } => {
                let Some(entry) = self.queries.get_mut(cache_key) else {
                    return Applied::ignored();
                };
                if entry.request_id != *request_id {
                    return Applied::stale();
                }
                entry.status = QueryStatus::Rejected;
                entry.data = None;
                entry.error = Some(error.clone());
                entry.meta = meta.clone();
                if *with_value {
                    self.provided.provide(cache_key, provided_tags);
                }
                Applied::changed()
            }
            Action::QueryUpserted {
                cache_key,
                endpoint,
                args,
                request_id,
                data,
                provided_tags,
                fulfilled_at,
                received_at,
            } => {
                let created = !self.queries.contains_key(cache_key);
                let entry = self
                    .queries
                    .entry(cache_key.clone())
                    .or_insert_with(|| QueryEntry::new(endpoint, args, *request_id, *fulfilled_at));
                let merged = match api.endpoint(endpoint) {
                    Ok(definition) => definition.merge_data(entry.data.as_ref(), data.clone(), args),
                    Err(_) => data.clone(),
                };
                entry.status = QueryStatus::Fulfilled;
                entry.request_id = *request_id;
                entry.original_args = args.clone();
                entry.data = Some(merged);
                entry.error = None;
                entry.fulfilled_at = Some(*fulfilled_at);
                entry.received_at = Some(*received_at);
                self.provided.provide(cache_key, provided_tags);
                if created {
                    Applied::created()
                } else {
                    Applied::changed()
                }
            }
            Action::QueryDataPatched {
                cache_key,
                data,
                provided_tags,
            } => {
                let Some(entry) = self.queries.get_mut(cache_key) else {
                    return Applied::ignored();
                };
                let Some(current) = entry.data.as_ref() else {
                    return Applied::ignored();
                };
                entry.data = Some(Payload::share_with(current, data.clone()));
                self.provided.provide(cache_key, provided_tags);
                Applied::changed()
            }
            Action::MutationPending {
                mutation_key,
                endpoint,
                request_id,
                track,
                started_at,
                ..
            } => {
                if !*track {
                    return Applied::ignored();
                }
                self.mutations.insert(
                    mutation_key.clone(),
                    MutationEntry {
                        status: QueryStatus::Pending,
                        endpoint: endpoint.clone(),
                        request_id: *request_id,
                        data: None,
                        error: None,
                        meta: None,
                        started_at: *started_at,
                        fulfilled_at: None,
                    },
                );
                Applied::created()
            }
            Action::MutationFulfilled {
                mutation_key,
                request_id,
                data,
                meta,
                fulfilled_at,
                ..
            } => {
                let Some(entry) = self.mutations.get_mut(mutation_key) else {
                    return Applied::ignored();
                };
                if entry.request_id != *request_id {
                    return Applied::stale();
                }
                entry.status = QueryStatus::Fulfilled;
                entry.data = Some(data.clone());
                entry.error = None;
                entry.meta = meta.clone();
                entry.fulfilled_at = Some(*fulfilled_at);
                Applied::changed()
            }
            Action::MutationRejected {
                mutation_key,
                request_id,
                error,
                meta,
                ..
            } => {
                let Some(entry) = self.mutations.get_mut(mutation_key) else {
                    return Applied::ignored();
                };
                if entry.request_id != *request_id {
                    return Applied::stale();
                }
                entry.status = QueryStatus::Rejected;
                entry.data = None;
                entry.error = Some(error.clone());
                entry.meta = meta.clone();
                Applied::changed()
            }
            Action::RemoveQueryResult { cache_key } => {
                let removed = self.queries.remove(cache_key).is_some();
                self.subscriptions.remove(cache_key);
                self.provided.unregister(cache_key);
                Applied::removed(removed)
            }
            Action::RemoveMutationResult {
                mutation_key,
                request_id,
            } => {
                let owned = self.mutations.get(mutation_key).is_some_and(|entry| {
                    request_id.is_none_or(|request_id| entry.request_id == request_id)
                });
                if owned {
                    self.mutations.remove(mutation_key);
                }
                Applied::removed(owned)
            }
            Action::UpdateSubscriptionOptions {
                cache_key,
                request_id,
                options,
            } => {
                let Some(current) = self
                    .subscriptions
                    .get_mut(cache_key)
                    .and_then(|subscribers| subscribers.get_mut(request_id))
                else {
                    return Applied::ignored();
                };
                *current = options.clone();
                Applied::changed()
            }
            Action::Unsubscribe {
                cache_key,
                request_id,
            } => {
                let Some(subscribers) = self.subscriptions.get_mut(cache_key) else {
                    return Applied::ignored();
                };
                let removed = subscribers.remove(request_id).is_some();
                if subscribers.is_empty() {
                    self.subscriptions.remove(cache_key);
                }
                Applied::flag(removed)
            }
            Action::InvalidateTags { .. } => Applied::ignored(),
            Action::SetFocused(focused) => {
                let changed = self.config.focused != *focused;
                self.config.focused = *focused;
                Applied::flag(changed)
            }
            Action::SetOnline(online) => {
                let changed = self.config.online != *online;
                self.config.online = *online;
                Applied::flag(changed)
            }
            Action::MiddlewareRegistered => {
                let changed = !self.config.middleware_registered;
                self.config.middleware_registered = true;
                Applied::flag(changed)
            }
            Action::ResetApiState => {
                self.queries.clear();
                self.mutations.clear();
                self.subscriptions.clear();
                self.provided.clear();
                Applied::changed()
            }
            Action::Rehydrate {
                snapshot,
                restored_at,
                restored_instant,
            } => {
                self.rehydrate(snapshot, *restored_at, *restored_instant);
                Applied::changed()
            }
        }
    }

    fn subscribe(&mut self, cache_key: &CacheKey, request_id: RequestId, options: &SubscriptionOptions) {
        self.subscriptions
            .entry(cache_key.clone())
            .or_default()
            .insert(request_id, options.clone());
    }

    fn rehydrate(&mut self, snapshot: &Snapshot, restored_at: OffsetDateTime, restored_instant: Instant) {
        for (key, entry) in &snapshot.queries {
            if !entry.status.is_terminal() {
                continue;
            }
            let mut entry = entry.clone();
            entry.received_at = entry.fulfilled_at.map(|fulfilled_at| {
                let age = Duration::try_from(restored_at - fulfilled_at).unwrap_or_default();
                restored_instant.checked_sub(age).unwrap_or(restored_instant)
            });
            self.queries.insert(key.clone(), entry);
        }

        for (key, entry) in &snapshot.mutations {
            if entry.status.is_terminal() {
                self.mutations.insert(key.clone(), entry.clone());
            }
        }

        let mut provided: HashMap<&CacheKey, Vec<Tag>> = HashMap::new();
        for entry in &snapshot.provided {
            if self.queries.contains_key(&entry.cache_key) {
                provided
                    .entry(&entry.cache_key)
                    .or_default()
                    .push(entry.tag.clone());
            }
        }
        for (key, tags) in provided {
            self.provided.provide(key, &tags);
        }
    }
}

/// Read-only view of a query entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub cache_key: CacheKey,
    pub status: QueryStatus,
    pub endpoint: Option<String>,
    pub original_args: Option<Payload>,
    pub request_id: Option<RequestId>,
    pub data: Option<Payload>,
    pub error: Option<Payload>,
    pub meta: Option<Payload>,
    pub started_at: Option<OffsetDateTime>,
    pub fulfilled_at: Option<OffsetDateTime>,
}

impl QueryResult {
    pub(crate) fn from_entry(cache_key: &CacheKey, entry: Option<&QueryEntry>) -> Self {
        match entry {
            Some(entry) => Self {
                cache_key: cache_key.clone(),
                status: entry.status,
                endpoint: Some(entry.endpoint.clone()),
                original_args: Some(entry.original_args.clone()),
                request_id: Some(entry.request_id),
                data: entry.data.clone(),
                error: entry.error.clone(),
                meta: entry.meta.clone(),
                started_at: Some(entry.started_at),
                fulfilled_at: entry.fulfilled_at,
            },
            None => Self {
                cache_key: cache_key.clone(),
                status: QueryStatus::Uninitialized,
                endpoint: None,
                original_args: None,
                request_id: None,
                data: None,
                error: None,
                meta: None,
                started_at: None,
                fulfilled_at: None,
            },
        }
    }

    pub fn is_uninitialized(&self) -> bool {
        self.status == QueryStatus::Uninitialized
    }

    /// First load: pending without any data yet.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Pending && self.data.is_none()
    }

    pub fn is_fetching(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Fulfilled
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Rejected
    }
}

/// Read-only view of a mutation entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult {
    pub status: QueryStatus,
    pub endpoint: Option<String>,
    pub request_id: Option<RequestId>,
    pub data: Option<Payload>,
    pub error: Option<Payload>,
    pub started_at: Option<OffsetDateTime>,
    pub fulfilled_at: Option<OffsetDateTime>,
}

impl MutationResult {
    pub(crate) fn from_entry(entry: Option<&MutationEntry>) -> Self {
        match entry {
            Some(entry) => Self {
                status: entry.status,
                endpoint: Some(entry.endpoint.clone()),
                request_id: Some(entry.request_id),
                data: entry.data.clone(),
                error: entry.error.clone(),
                started_at: Some(entry.started_at),
                fulfilled_at: entry.fulfilled_at,
            },
            None => Self::uninitialized(),
        }
    }

    pub(crate) fn uninitialized() -> Self {
        Self {
            status: QueryStatus::Uninitialized,
            endpoint: None,
            request_id: None,
            data: None,
            error: None,
            started_at: None,
            fulfilled_at: None,
        }
    }

    pub fn is_uninitialized(&self) -> bool {
        self.status == QueryStatus::Uninitialized
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Fulfilled
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Rejected
    }
}
