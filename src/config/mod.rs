//! Configuration layer: typed settings with layered precedence (defaults → files → env).

use std::{path::Path, str::FromStr, time::Duration};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{InvalidationBehavior, MAX_TIMER_DELAY, RefetchPolicy};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "quarry";
const ENV_PREFIX: &str = "QUARRY";
const DEFAULT_KEEP_UNUSED_DATA_FOR_SECS: u64 = 60;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

/// Engine-wide cache behaviour; every duration is a [`Duration`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub keep_unused_data_for: Duration,
    pub refetch_on_mount_or_arg_change: RefetchPolicy,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
    pub invalidation_behavior: InvalidationBehavior,
    pub max_timer_delay: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            keep_unused_data_for: Duration::from_secs(DEFAULT_KEEP_UNUSED_DATA_FOR_SECS),
            refetch_on_mount_or_arg_change: RefetchPolicy::Never,
            refetch_on_focus: false,
            refetch_on_reconnect: false,
            invalidation_behavior: InvalidationBehavior::Delayed,
            max_timer_delay: MAX_TIMER_DELAY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence.
///
/// `config/default` and `quarry` files are optional; an explicit `path` must
/// exist. Environment variables prefixed `QUARRY__` win over files, e.g.
/// `QUARRY__CACHE__KEEP_UNUSED_DATA_FOR_SECS=30`.
pub fn load(path: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    logging: RawLoggingSettings,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { cache, logging } = raw;

        let cache = build_cache_settings(cache)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self { cache, logging })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let keep_unused_data_for = Duration::from_secs(
        cache
            .keep_unused_data_for_secs
            .unwrap_or(DEFAULT_KEEP_UNUSED_DATA_FOR_SECS),
    );

    let refetch_on_mount_or_arg_change = match cache.refetch_on_mount_or_arg_change {
        None | Some(RawRefetch::Flag(false)) => RefetchPolicy::Never,
        Some(RawRefetch::Flag(true)) => RefetchPolicy::Always,
        Some(RawRefetch::Seconds(secs)) => RefetchPolicy::IfOlderThan(Duration::from_secs(secs)),
    };

    let invalidation_behavior = match cache.invalidation_behavior.as_deref() {
        None | Some("delayed") => InvalidationBehavior::Delayed,
        Some("immediately") => InvalidationBehavior::Immediately,
        Some(other) => {
            return Err(LoadError::invalid(
                "cache.invalidation_behavior",
                format!("expected `delayed` or `immediately`, got `{other}`"),
            ));
        }
    };

    let max_timer_delay = match cache.max_timer_delay_ms {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.max_timer_delay_ms",
                "must be greater than zero",
            ));
        }
        Some(ms) => Duration::from_millis(ms).min(MAX_TIMER_DELAY),
        None => MAX_TIMER_DELAY,
    };

    Ok(CacheSettings {
        keep_unused_data_for,
        refetch_on_mount_or_arg_change,
        refetch_on_focus: cache.refetch_on_focus.unwrap_or(false),
        refetch_on_reconnect: cache.refetch_on_reconnect.unwrap_or(false),
        invalidation_behavior,
        max_timer_delay,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

/// `refetch_on_mount_or_arg_change` accepts a flag or a max age in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum RawRefetch {
    Flag(bool),
    Seconds(u64),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    keep_unused_data_for_secs: Option<u64>,
    refetch_on_mount_or_arg_change: Option<RawRefetch>,
    refetch_on_focus: Option<bool>,
    refetch_on_reconnect: Option<bool>,
    invalidation_behavior: Option<String>,
    max_timer_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[cfg(test)]
mod tests;
