//! Per-key polling.
//!
//! The effective interval of a key is the lowest non-zero interval among its
//! subscribers. The next poll is measured from the completion of the previous
//! request, not from a fixed grid.

use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::engine::QueryEngine;
use super::events::Action;
use super::keys::CacheKey;
use super::collector::clamp_delay;
use super::scheduler::{Timers, deadline_after};
use super::state::{Applied, ApiState, QueryStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollingDemand {
    pub(crate) interval: Duration,
    pub(crate) skip_if_unfocused: bool,
}

pub(crate) struct Poller {
    timers: Timers<CacheKey>,
    /// Last armed deadline per key; kept after the timer fires so that the
    /// poll's own pending action does not re-arm it.
    next_poll: DashMap<CacheKey, Instant>,
}

impl Poller {
    pub(crate) fn new(runtime: Handle) -> Self {
        Self {
            timers: Timers::new("polling", runtime),
            next_poll: DashMap::new(),
        }
    }

    pub(crate) fn on_action(&self, engine: &QueryEngine, action: &Action, _applied: &Applied) {
        match action {
            Action::QueryPending { cache_key, .. }
            | Action::QuerySkipped { cache_key, .. }
            | Action::UpdateSubscriptionOptions { cache_key, .. }
            | Action::Unsubscribe { cache_key, .. } => self.update(engine, cache_key),
            Action::QueryFulfilled { cache_key, .. } | Action::QueryRejected { cache_key, .. } => {
                self.start_next(engine, cache_key)
            }
            Action::RemoveQueryResult { cache_key } => self.cleanup(cache_key),
            Action::ResetApiState => {
                self.timers.clear();
                self.next_poll.clear();
            }
            _ => {}
        }
    }

    /// Re-evaluate after a subscription change; only an earlier deadline
    /// replaces an armed poll.
    fn update(&self, engine: &QueryEngine, cache_key: &CacheKey) {
        let Some(demand) = engine.with_state(|state| demand_for(state, cache_key)) else {
            if engine.with_state(|state| initialized(state, cache_key)) {
                self.cleanup(cache_key);
            }
            return;
        };

        let next = deadline_after(demand.interval);
        let armed = self.next_poll.get(cache_key).map(|at| *at);
        if armed.is_none_or(|armed| next < armed) {
            self.start_next(engine, cache_key);
        }
    }

    fn start_next(&self, engine: &QueryEngine, cache_key: &CacheKey) {
        let Some(demand) = engine.with_state(|state| demand_for(state, cache_key)) else {
            self.cleanup(cache_key);
            return;
        };

        let next = deadline_after(demand.interval);
        self.next_poll.insert(cache_key.clone(), next);
        debug!(
            cache_key = %cache_key,
            interval_ms = demand.interval.as_millis() as u64,
            "Scheduled next poll"
        );

        let weak = engine.downgrade();
        let key = cache_key.clone();
        self.timers.schedule_at(cache_key.clone(), next, move || {
            if let Some(engine) = weak.upgrade() {
                engine.poller().fire(&engine, &key);
            }
        });
    }

    fn fire(&self, engine: &QueryEngine, cache_key: &CacheKey) {
        let snapshot = engine.with_state(|state| {
            let entry = state.query(cache_key)?;
            let demand = demand_for(state, cache_key)?;
            Some((
                entry.endpoint.clone(),
                entry.original_args.clone(),
                demand,
                state.config().focused,
            ))
        });
        let Some((endpoint, args, demand, focused)) = snapshot else {
            self.cleanup(cache_key);
            return;
        };

        if demand.skip_if_unfocused && !focused {
            debug!(cache_key = %cache_key, "Skipping poll while unfocused");
            self.start_next(engine, cache_key);
            return;
        }

        debug!(cache_key = %cache_key, "Polling");
        if let Err(err) = engine.refetch_entry(&endpoint, args) {
            warn!(cache_key = %cache_key, error = %err, "Poll refetch could not start");
            self.start_next(engine, cache_key);
        }
    }

    fn cleanup(&self, cache_key: &CacheKey) {
        self.timers.cancel(cache_key);
        self.next_poll.remove(cache_key);
    }

    pub(crate) fn next_poll(&self, cache_key: &CacheKey) -> Option<Instant> {
        self.timers.deadline(cache_key)
    }
}

fn initialized(state: &ApiState, cache_key: &CacheKey) -> bool {
    state
        .query(cache_key)
        .is_some_and(|entry| entry.status != QueryStatus::Uninitialized)
}

/// Lowest polling interval over the current subscribers of an initialized
/// entry, clamped to the configured timer ceiling.
pub(crate) fn demand_for(state: &ApiState, cache_key: &CacheKey) -> Option<PollingDemand> {
    if !initialized(state, cache_key) {
        return None;
    }
    let subscribers = state.subscribers(cache_key)?;
    let interval = subscribers
        .values()
        .filter_map(|options| options.active_polling())
        .min()?;
    let skip_if_unfocused = subscribers
        .values()
        .any(|options| options.skip_polling_if_unfocused);
    Some(PollingDemand {
        interval: clamp_delay(interval, state.config().max_timer_delay),
        skip_if_unfocused,
    })
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::cache::endpoint::Api;
    use crate::cache::keys::RequestId;
    use crate::cache::payload::Payload;
    use crate::cache::state::SubscriptionOptions;

    fn subscribe(state: &mut ApiState, key: &CacheKey, options: SubscriptionOptions) {
        state.apply(
            &Action::QueryPending {
                cache_key: key.clone(),
                endpoint: "feed".to_string(),
                args: Payload::Null,
                request_id: RequestId::new(),
                subscribe: true,
                options,
                forced: false,
                started_at: OffsetDateTime::now_utc(),
            },
            &Api::default(),
        );
    }

    #[test]
    fn lowest_non_zero_interval_wins() {
        let key = CacheKey::from("feed(null)");
        let mut state = ApiState::default();
        for secs in [30, 10, 20, 0] {
            subscribe(
                &mut state,
                &key,
                SubscriptionOptions::default().polling_interval(Duration::from_secs(secs)),
            );
        }
        subscribe(&mut state, &key, SubscriptionOptions::default());

        let demand = demand_for(&state, &key).expect("polling demand");
        assert_eq!(demand.interval, Duration::from_secs(10));
        assert!(!demand.skip_if_unfocused);
    }

    #[test]
    fn no_polling_subscribers_means_no_demand() {
        let key = CacheKey::from("feed(null)");
        let mut state = ApiState::default();
        subscribe(&mut state, &key, SubscriptionOptions::default());
        assert!(demand_for(&state, &key).is_none());
    }

    #[test]
    fn any_subscriber_can_request_unfocused_skip() {
        let key = CacheKey::from("feed(null)");
        let mut state = ApiState::default();
        subscribe(
            &mut state,
            &key,
            SubscriptionOptions::default().polling_interval(Duration::from_secs(5)),
        );
        subscribe(
            &mut state,
            &key,
            SubscriptionOptions::default()
                .polling_interval(Duration::from_secs(50))
                .skip_polling_if_unfocused(true),
        );
        let demand = demand_for(&state, &key).expect("polling demand");
        assert_eq!(demand.interval, Duration::from_secs(5));
        assert!(demand.skip_if_unfocused);
    }
}
