//! Tag-driven invalidation.
//!
//! Mutations that settle with a value and explicit `invalidate_tags` calls
//! feed tags here. In delayed mode tags are held back while any request is in
//! flight and flushed on the settlement that leaves the engine idle.

use std::sync::Mutex;

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::infra::telemetry::{METRIC_CACHE_EVICT_TOTAL, METRIC_INVALIDATION_KEYS};

use super::engine::QueryEngine;
use super::events::Action;
use super::lock::mutex_lock;
use super::planner::InvalidationPlan;
use super::state::{Applied, InvalidationBehavior};
use super::tags::Tag;

const SOURCE: &str = "cache::invalidation";

#[derive(Default)]
pub(crate) struct Invalidator {
    pending: Mutex<Vec<Tag>>,
}

impl Invalidator {
    pub(crate) fn on_action(&self, engine: &QueryEngine, action: &Action, _applied: &Applied) {
        match action {
            Action::MutationFulfilled {
                invalidated_tags, ..
            }
            | Action::MutationRejected {
                with_value: true,
                invalidated_tags,
                ..
            } => self.invalidate(engine, invalidated_tags),
            Action::InvalidateTags { tags } => self.invalidate(engine, tags),
            Action::ResetApiState => mutex_lock(&self.pending, SOURCE, "reset").clear(),
            _ => {}
        }

        if action.is_settlement() {
            self.flush_if_idle(engine);
        }
    }

    fn invalidate(&self, engine: &QueryEngine, tags: &[Tag]) {
        if tags.is_empty() {
            return;
        }

        let hold = engine.with_state(|state| {
            state.config().invalidation_behavior == InvalidationBehavior::Delayed
                && state.has_pending()
        });
        if hold {
            let mut pending = mutex_lock(&self.pending, SOURCE, "hold");
            for tag in tags {
                if !pending.contains(tag) {
                    pending.push(tag.clone());
                }
            }
            debug!(held = pending.len(), "Holding invalidation until requests settle");
            return;
        }

        run(engine, tags);
    }

    fn flush_if_idle(&self, engine: &QueryEngine) {
        if engine.with_state(|state| state.has_pending()) {
            return;
        }
        let tags = std::mem::take(&mut *mutex_lock(&self.pending, SOURCE, "flush"));
        if !tags.is_empty() {
            run(engine, &tags);
        }
    }

    pub(crate) fn held(&self) -> usize {
        mutex_lock(&self.pending, SOURCE, "held").len()
    }
}

fn run(engine: &QueryEngine, tags: &[Tag]) {
    let plan = engine.with_state(|state| InvalidationPlan::from_tags(state, tags));
    histogram!(METRIC_INVALIDATION_KEYS).record(plan.len() as f64);
    if plan.is_empty() {
        debug!(tags = ?tags, "Invalidation matched no entries");
        return;
    }

    info!(tags = ?tags, plan = %plan, "Invalidating cache entries");

    for cache_key in plan.evict {
        counter!(METRIC_CACHE_EVICT_TOTAL, "reason" => "invalidated").increment(1);
        engine.dispatch(Action::RemoveQueryResult { cache_key });
    }
    for target in plan.refetch {
        if let Err(err) = engine.refetch_entry(&target.endpoint, target.args) {
            warn!(
                cache_key = %target.cache_key,
                error = %err,
                "Invalidation refetch could not start"
            );
        }
    }
}
