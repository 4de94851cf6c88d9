//! Delayed removal of unsubscribed query entries.
//!
//! A timer is (re)armed whenever an entry is left without subscribers. The
//! subscriber count is only re-checked when the timer fires, so a consumer
//! that subscribes again in the meantime keeps the entry alive.

use std::time::Duration;

use metrics::counter;
use tokio::runtime::Handle;
use tracing::debug;

use crate::infra::telemetry::METRIC_CACHE_EVICT_TOTAL;

use super::engine::QueryEngine;
use super::events::Action;
use super::keys::CacheKey;
use super::scheduler::Timers;
use super::state::Applied;

pub(crate) struct Collector {
    timers: Timers<CacheKey>,
}

impl Collector {
    pub(crate) fn new(runtime: Handle) -> Self {
        Self {
            timers: Timers::new("cache_collection", runtime),
        }
    }

    pub(crate) fn on_action(&self, engine: &QueryEngine, action: &Action, _applied: &Applied) {
        match action {
            // a cache hit must not extend an armed retention window
            Action::QuerySkipped { cache_key, .. } => {
                if self.timers.deadline(cache_key).is_none() {
                    self.schedule_if_unused(engine, cache_key);
                }
            }
            Action::Unsubscribe { cache_key, .. }
            | Action::QueryFulfilled { cache_key, .. }
            | Action::QueryRejected { cache_key, .. }
            | Action::QueryUpserted { cache_key, .. } => self.schedule_if_unused(engine, cache_key),
            Action::RemoveQueryResult { cache_key } => {
                self.timers.cancel(cache_key);
            }
            Action::ResetApiState => self.timers.clear(),
            Action::Rehydrate { .. } => {
                let keys: Vec<CacheKey> = engine.with_state(|state| {
                    state
                        .queries()
                        .filter(|(key, _)| state.subscriber_count(key) == 0)
                        .map(|(key, _)| key.clone())
                        .collect()
                });
                for key in keys {
                    self.schedule_if_unused(engine, &key);
                }
            }
            _ => {}
        }
    }

    fn schedule_if_unused(&self, engine: &QueryEngine, cache_key: &CacheKey) {
        let ttl = engine.with_state(|state| {
            let entry = state.query(cache_key)?;
            if state.subscriber_count(cache_key) > 0 {
                return None;
            }
            let config = state.config();
            let ttl = engine
                .api()
                .endpoint(&entry.endpoint)
                .ok()
                .and_then(|definition| definition.keep_unused_override())
                .unwrap_or(config.keep_unused_data_for);
            Some(clamp_delay(ttl, config.max_timer_delay))
        });
        let Some(ttl) = ttl else {
            return;
        };

        debug!(
            cache_key = %cache_key,
            ttl_ms = ttl.as_millis() as u64,
            "Scheduled removal of unused cache entry"
        );
        let weak = engine.downgrade();
        let key = cache_key.clone();
        self.timers.schedule_in(cache_key.clone(), ttl, move || {
            if let Some(engine) = weak.upgrade() {
                collect(&engine, &key);
            }
        });
    }

    pub(crate) fn scheduled(&self) -> usize {
        self.timers.len()
    }
}

/// Clamp a retention period into the range the timer layer accepts.
pub(crate) fn clamp_delay(delay: Duration, max: Duration) -> Duration {
    delay.min(max)
}

fn collect(engine: &QueryEngine, cache_key: &CacheKey) {
    let unused = engine.with_state(|state| {
        state.query(cache_key).is_some() && state.subscriber_count(cache_key) == 0
    });
    if !unused {
        debug!(cache_key = %cache_key, "Cache entry regained subscribers; keeping it");
        return;
    }

    debug!(cache_key = %cache_key, "Removing unused cache entry");
    counter!(METRIC_CACHE_EVICT_TOTAL, "reason" => "unused").increment(1);
    engine.dispatch(Action::RemoveQueryResult {
        cache_key: cache_key.clone(),
    });
}
