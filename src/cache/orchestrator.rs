//! Request orchestration.
//!
//! Decides whether a query start executes a fetch, runs the fetch
//! collaborator under cancellation and panic isolation, and turns the outcome
//! into the settlement action for the entry.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use futures::FutureExt;
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::infra::telemetry::{METRIC_CONTRACT_VIOLATION_TOTAL, METRIC_FETCH_MS, METRIC_FETCH_TOTAL};

use super::endpoint::{EndpointDefinition, EndpointKind};
use super::engine::{QueryEngine, WeakEngine};
use super::events::Action;
use super::fetch::{BaseQuery, FetchContext, Fetched, SerializedError};
use super::keys::{CacheKey, RequestId};
use super::payload::Payload;
use super::state::{QueryEntry, QueryStatus, RefetchPolicy};
use super::tags::TagInput;

/// Result of the condition check for a query start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Condition {
    /// Run a new fetch. `forced` is set when cached data was bypassed.
    Execute { forced: bool },
    /// Another request for the key is pending; join it.
    InFlight,
    /// Serve cached data.
    Cached,
}

pub(crate) fn condition(
    entry: Option<&QueryEntry>,
    definition: &EndpointDefinition,
    args: &Payload,
    policy: RefetchPolicy,
    now: Instant,
) -> Condition {
    let Some(entry) = entry else {
        return Condition::Execute { forced: false };
    };
    if entry.status == QueryStatus::Pending {
        return Condition::InFlight;
    }
    if definition.forces_refetch(args, Some(&entry.original_args)) || policy.is_due(entry.received_at, now) {
        return Condition::Execute { forced: true };
    }
    if !entry.has_been_fulfilled() {
        return Condition::Execute { forced: false };
    }
    Condition::Cached
}

/// Normalized outcome of one fetch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FetchOutcome {
    Data { data: Payload, meta: Option<Payload> },
    Error { error: Payload, meta: Option<Payload> },
    /// Aborted, panicked or contract-violating call. Carries no tags.
    Thrown(SerializedError),
}

impl FetchOutcome {
    fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Data { .. } => "data",
            FetchOutcome::Error { .. } => "error",
            FetchOutcome::Thrown(_) => "thrown",
        }
    }
}

/// One logical request handed from the initiate layer to a fetch task.
pub(crate) struct Request {
    pub(crate) key: CacheKey,
    pub(crate) endpoint: String,
    pub(crate) kind: EndpointKind,
    pub(crate) args: Payload,
    pub(crate) request_id: RequestId,
    pub(crate) forced: bool,
    pub(crate) definition: Arc<EndpointDefinition>,
}

impl Request {
    fn context(&self, signal: CancellationToken) -> FetchContext {
        FetchContext {
            endpoint: self.endpoint.clone(),
            kind: self.kind,
            request_id: self.request_id,
            forced: self.forced,
            signal,
        }
    }

    fn tag_input<'a>(&'a self, outcome: &'a FetchOutcome) -> TagInput<'a> {
        match outcome {
            FetchOutcome::Data { data, .. } => TagInput {
                result: Some(data),
                error: None,
                args: &self.args,
            },
            FetchOutcome::Error { error, .. } => TagInput {
                result: None,
                error: Some(error),
                args: &self.args,
            },
            FetchOutcome::Thrown(_) => TagInput {
                result: None,
                error: None,
                args: &self.args,
            },
        }
    }
}

/// Invoke the fetch collaborator.
///
/// The call is raced against `signal`; a cancelled, panicking or
/// contract-violating call becomes [`FetchOutcome::Thrown`].
pub(crate) async fn run_fetch(
    fetcher: Arc<dyn BaseQuery>,
    args: Payload,
    ctx: FetchContext,
) -> FetchOutcome {
    let signal = ctx.signal.clone();
    let endpoint = ctx.endpoint.clone();
    let request_id = ctx.request_id;
    let call = AssertUnwindSafe(fetcher.execute(args, ctx)).catch_unwind();

    tokio::select! {
        biased;
        _ = signal.cancelled() => {
            debug!(endpoint, request_id = %request_id, "Fetch aborted");
            FetchOutcome::Thrown(SerializedError::aborted())
        }
        result = call => match result {
            Ok(result) => match result.validate() {
                Ok(Fetched::Data { data, meta }) => FetchOutcome::Data { data, meta },
                Ok(Fetched::Error { error, meta }) => FetchOutcome::Error { error, meta },
                Err(violation) => {
                    counter!(METRIC_CONTRACT_VIOLATION_TOTAL).increment(1);
                    warn!(
                        endpoint,
                        request_id = %request_id,
                        violation = %violation,
                        "Fetch collaborator broke the result contract"
                    );
                    FetchOutcome::Thrown(SerializedError::from(&violation))
                }
            },
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(endpoint, request_id = %request_id, panic = %message, "Fetch collaborator panicked");
                FetchOutcome::Thrown(SerializedError::new("Panic", message))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "fetch collaborator panicked".to_string()
    }
}

fn record(kind: EndpointKind, outcome: &FetchOutcome, elapsed: Duration) {
    counter!(METRIC_FETCH_TOTAL, "kind" => kind.as_str(), "outcome" => outcome.label()).increment(1);
    histogram!(METRIC_FETCH_MS, "kind" => kind.as_str()).record(elapsed.as_secs_f64() * 1000.0);
}

/// Fetch task of an executing query start.
#[instrument(
    name = "query",
    skip_all,
    fields(endpoint = %request.endpoint, cache_key = %request.key, request_id = %request.request_id)
)]
pub(crate) async fn execute_query(weak: WeakEngine, request: Request, signal: CancellationToken) {
    let started = StdInstant::now();
    let outcome = run_fetch(
        request.definition.fetcher(),
        request.args.clone(),
        request.context(signal),
    )
    .await;
    record(request.kind, &outcome, started.elapsed());

    let Some(engine) = weak.upgrade() else {
        debug!("Engine dropped before the query settled");
        return;
    };
    settle_query(&engine, &request, outcome);
    engine.running().finish_query(&request.key, request.request_id);
}

pub(crate) fn settle_query(engine: &QueryEngine, request: &Request, outcome: FetchOutcome) {
    let provided_tags = match &outcome {
        FetchOutcome::Thrown(_) => Vec::new(),
        _ => request.definition.provided_tags(request.tag_input(&outcome)),
    };
    let action = match outcome {
        FetchOutcome::Data { data, meta } => Action::QueryFulfilled {
            cache_key: request.key.clone(),
            request_id: request.request_id,
            data,
            meta,
            provided_tags,
            fulfilled_at: OffsetDateTime::now_utc(),
            received_at: Instant::now(),
        },
        FetchOutcome::Error { error, meta } => Action::QueryRejected {
            cache_key: request.key.clone(),
            request_id: request.request_id,
            error,
            meta,
            with_value: true,
            provided_tags,
        },
        FetchOutcome::Thrown(thrown) => Action::QueryRejected {
            cache_key: request.key.clone(),
            request_id: request.request_id,
            error: thrown.into_payload(),
            meta: None,
            with_value: false,
            provided_tags,
        },
    };
    engine.dispatch(action);
}

/// Fetch task of a mutation; resolves with the data or the error value.
#[instrument(
    name = "mutation",
    skip_all,
    fields(endpoint = %request.endpoint, mutation_key = %request.key, request_id = %request.request_id)
)]
pub(crate) async fn execute_mutation(
    weak: WeakEngine,
    request: Request,
    signal: CancellationToken,
    alias: Option<String>,
) -> Result<Payload, Payload> {
    let started = StdInstant::now();
    let outcome = run_fetch(
        request.definition.fetcher(),
        request.args.clone(),
        request.context(signal),
    )
    .await;
    record(request.kind, &outcome, started.elapsed());

    let result = match &outcome {
        FetchOutcome::Data { data, .. } => Ok(data.clone()),
        FetchOutcome::Error { error, .. } => Err(error.clone()),
        FetchOutcome::Thrown(thrown) => Err(thrown.clone().into_payload()),
    };

    match weak.upgrade() {
        Some(engine) => {
            settle_mutation(&engine, &request, outcome);
            engine
                .running()
                .finish_mutation(request.request_id, alias.as_deref());
        }
        None => debug!("Engine dropped before the mutation settled"),
    }
    result
}

pub(crate) fn settle_mutation(engine: &QueryEngine, request: &Request, outcome: FetchOutcome) {
    let invalidated_tags = match &outcome {
        FetchOutcome::Thrown(_) => Vec::new(),
        _ => request.definition.invalidated_tags(request.tag_input(&outcome)),
    };
    let action = match outcome {
        FetchOutcome::Data { data, meta } => Action::MutationFulfilled {
            mutation_key: request.key.clone(),
            request_id: request.request_id,
            data,
            meta,
            invalidated_tags,
            fulfilled_at: OffsetDateTime::now_utc(),
        },
        FetchOutcome::Error { error, meta } => Action::MutationRejected {
            mutation_key: request.key.clone(),
            request_id: request.request_id,
            error,
            meta,
            with_value: true,
            invalidated_tags,
        },
        FetchOutcome::Thrown(thrown) => Action::MutationRejected {
            mutation_key: request.key.clone(),
            request_id: request.request_id,
            error: thrown.into_payload(),
            meta: None,
            with_value: false,
            invalidated_tags,
        },
    };
    engine.dispatch(action);
}
