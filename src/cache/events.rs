//! Engine actions.
//!
//! Every state transition is expressed as an [`Action`] and applied through
//! the engine's single dispatch path. Listeners react to the same actions
//! after the reducer has run.

use time::OffsetDateTime;
use tokio::time::Instant;

use super::keys::{CacheKey, RequestId};
use super::payload::Payload;
use super::persist::Snapshot;
use super::state::SubscriptionOptions;
use super::tags::Tag;

/// Monotonic dispatch counter, used to order actions in logs.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub enum Action {
    /// A query request passed its condition and is about to fetch.
    QueryPending {
        cache_key: CacheKey,
        endpoint: String,
        args: Payload,
        request_id: RequestId,
        subscribe: bool,
        options: SubscriptionOptions,
        forced: bool,
        started_at: OffsetDateTime,
    },
    /// A query request was served from cache or joined an in-flight fetch.
    QuerySkipped {
        cache_key: CacheKey,
        request_id: RequestId,
        subscribe: bool,
        options: SubscriptionOptions,
    },
    QueryFulfilled {
        cache_key: CacheKey,
        request_id: RequestId,
        data: Payload,
        meta: Option<Payload>,
        provided_tags: Vec<Tag>,
        fulfilled_at: OffsetDateTime,
        received_at: Instant,
    },
    QueryRejected {
        cache_key: CacheKey,
        request_id: RequestId,
        error: Payload,
        meta: Option<Payload>,
        /// The fetcher reported the error (as opposed to an abort, panic or
        /// contract violation).
        with_value: bool,
        provided_tags: Vec<Tag>,
    },
    /// Data written without a network call.
    QueryUpserted {
        cache_key: CacheKey,
        endpoint: String,
        args: Payload,
        request_id: RequestId,
        data: Payload,
        provided_tags: Vec<Tag>,
        fulfilled_at: OffsetDateTime,
        received_at: Instant,
    },
    QueryDataPatched {
        cache_key: CacheKey,
        data: Payload,
        provided_tags: Vec<Tag>,
    },
    MutationPending {
        mutation_key: CacheKey,
        endpoint: String,
        args: Payload,
        request_id: RequestId,
        track: bool,
        started_at: OffsetDateTime,
    },
    MutationFulfilled {
        mutation_key: CacheKey,
        request_id: RequestId,
        data: Payload,
        meta: Option<Payload>,
        invalidated_tags: Vec<Tag>,
        fulfilled_at: OffsetDateTime,
    },
    MutationRejected {
        mutation_key: CacheKey,
        request_id: RequestId,
        error: Payload,
        meta: Option<Payload>,
        with_value: bool,
        invalidated_tags: Vec<Tag>,
    },
    RemoveQueryResult {
        cache_key: CacheKey,
    },
    /// Remove a mutation entry; with a request id, only if it still owns it.
    RemoveMutationResult {
        mutation_key: CacheKey,
        request_id: Option<RequestId>,
    },
    UpdateSubscriptionOptions {
        cache_key: CacheKey,
        request_id: RequestId,
        options: SubscriptionOptions,
    },
    Unsubscribe {
        cache_key: CacheKey,
        request_id: RequestId,
    },
    InvalidateTags {
        tags: Vec<Tag>,
    },
    SetFocused(bool),
    SetOnline(bool),
    MiddlewareRegistered,
    ResetApiState,
    Rehydrate {
        snapshot: Box<Snapshot>,
        restored_at: OffsetDateTime,
        restored_instant: Instant,
    },
}

impl Action {
    /// Stable name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Action::QueryPending { .. } => "query/pending",
            Action::QuerySkipped { .. } => "query/skipped",
            Action::QueryFulfilled { .. } => "query/fulfilled",
            Action::QueryRejected { .. } => "query/rejected",
            Action::QueryUpserted { .. } => "query/upserted",
            Action::QueryDataPatched { .. } => "query/patched",
            Action::MutationPending { .. } => "mutation/pending",
            Action::MutationFulfilled { .. } => "mutation/fulfilled",
            Action::MutationRejected { .. } => "mutation/rejected",
            Action::RemoveQueryResult { .. } => "query/removed",
            Action::RemoveMutationResult { .. } => "mutation/removed",
            Action::UpdateSubscriptionOptions { .. } => "subscription/updated",
            Action::Unsubscribe { .. } => "subscription/removed",
            Action::InvalidateTags { .. } => "tags/invalidated",
            Action::SetFocused(_) => "config/focused",
            Action::SetOnline(_) => "config/online",
            Action::MiddlewareRegistered => "config/middleware",
            Action::ResetApiState => "api/reset",
            Action::Rehydrate { .. } => "api/rehydrate",
        }
    }

    /// Cache key the action targets, if any.
    pub fn cache_key(&self) -> Option<&CacheKey> {
        match self {
            Action::QueryPending { cache_key, .. }
            | Action::QuerySkipped { cache_key, .. }
            | Action::QueryFulfilled { cache_key, .. }
            | Action::QueryRejected { cache_key, .. }
            | Action::QueryUpserted { cache_key, .. }
            | Action::QueryDataPatched { cache_key, .. }
            | Action::RemoveQueryResult { cache_key }
            | Action::UpdateSubscriptionOptions { cache_key, .. }
            | Action::Unsubscribe { cache_key, .. } => Some(cache_key),
            Action::MutationPending { mutation_key, .. }
            | Action::MutationFulfilled { mutation_key, .. }
            | Action::MutationRejected { mutation_key, .. }
            | Action::RemoveMutationResult { mutation_key, .. } => Some(mutation_key),
            _ => None,
        }
    }

    /// Whether the action settles a query or mutation request.
    pub fn is_settlement(&self) -> bool {
        matches!(
            self,
            Action::QueryFulfilled { .. }
                | Action::QueryRejected { .. }
                | Action::MutationFulfilled { .. }
                | Action::MutationRejected { .. }
        )
    }
}
