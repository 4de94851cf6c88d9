use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::EngineError;

pub(crate) const METRIC_FETCH_TOTAL: &str = "quarry_fetch_total";
pub(crate) const METRIC_FETCH_MS: &str = "quarry_fetch_ms";
pub(crate) const METRIC_QUERY_DEDUP_TOTAL: &str = "quarry_query_dedup_total";
pub(crate) const METRIC_CACHE_EVICT_TOTAL: &str = "quarry_cache_evict_total";
pub(crate) const METRIC_STALE_RESPONSE_TOTAL: &str = "quarry_stale_response_total";
pub(crate) const METRIC_CONTRACT_VIOLATION_TOTAL: &str = "quarry_contract_violation_total";
pub(crate) const METRIC_INVALIDATION_KEYS: &str = "quarry_invalidation_keys";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), EngineError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| EngineError::telemetry(format!("failed to install tracing subscriber: {err}")))
}

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_FETCH_TOTAL,
            Unit::Count,
            "Fetches executed, labelled by endpoint kind and outcome."
        );
        describe_histogram!(
            METRIC_FETCH_MS,
            Unit::Milliseconds,
            "Fetch latency in milliseconds, from dispatch to settlement."
        );
        describe_counter!(
            METRIC_QUERY_DEDUP_TOTAL,
            Unit::Count,
            "Query starts that joined an in-flight request instead of fetching."
        );
        describe_counter!(
            METRIC_CACHE_EVICT_TOTAL,
            Unit::Count,
            "Query entries removed, labelled by reason."
        );
        describe_counter!(
            METRIC_STALE_RESPONSE_TOTAL,
            Unit::Count,
            "Settlements dropped because a newer request owned the entry."
        );
        describe_counter!(
            METRIC_CONTRACT_VIOLATION_TOTAL,
            Unit::Count,
            "Fetch results that carried both or neither of data and error."
        );
        describe_histogram!(
            METRIC_INVALIDATION_KEYS,
            Unit::Count,
            "Cache keys affected per invalidation run."
        );
    });
}
