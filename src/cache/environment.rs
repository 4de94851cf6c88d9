//! Focus and connectivity driven refresh.

use futures::{Stream, StreamExt};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::infra::telemetry::METRIC_CACHE_EVICT_TOTAL;

use super::engine::QueryEngine;
use super::events::Action;
use super::keys::CacheKey;
use super::payload::Payload;
use super::state::{Applied, ApiState, QueryStatus, SubscriptionOptions};

/// Edge events reported by the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentSignal {
    Focused,
    Unfocused,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Focus,
    Reconnect,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Focus => "focus",
            Trigger::Reconnect => "reconnect",
        }
    }

    fn opted(self, options: &SubscriptionOptions) -> Option<bool> {
        match self {
            Trigger::Focus => options.refetch_on_focus,
            Trigger::Reconnect => options.refetch_on_reconnect,
        }
    }

    fn default_for(self, state: &ApiState) -> bool {
        match self {
            Trigger::Focus => state.config().refetch_on_focus,
            Trigger::Reconnect => state.config().refetch_on_reconnect,
        }
    }
}

#[derive(Debug)]
enum Refresh {
    Remove(CacheKey),
    Refetch { endpoint: String, args: Payload },
}

pub(crate) fn on_action(engine: &QueryEngine, action: &Action, applied: &Applied) {
    if !applied.changed {
        return;
    }
    match action {
        Action::SetFocused(true) => refresh(engine, Trigger::Focus),
        Action::SetOnline(true) => refresh(engine, Trigger::Reconnect),
        _ => {}
    }
}

fn refresh(engine: &QueryEngine, trigger: Trigger) {
    let plan = engine.with_state(|state| plan_refresh(state, trigger));
    if plan.is_empty() {
        return;
    }
    info!(trigger = trigger.as_str(), entries = plan.len(), "Refreshing cache entries");

    for step in plan {
        match step {
            Refresh::Remove(cache_key) => {
                counter!(METRIC_CACHE_EVICT_TOTAL, "reason" => trigger.as_str()).increment(1);
                engine.dispatch(Action::RemoveQueryResult { cache_key });
            }
            Refresh::Refetch { endpoint, args } => {
                if let Err(err) = engine.refetch_entry(&endpoint, args) {
                    warn!(endpoint, error = %err, "Environment refetch could not start");
                }
            }
        }
    }
}

fn plan_refresh(state: &ApiState, trigger: Trigger) -> Vec<Refresh> {
    let default = trigger.default_for(state);
    let mut plan = Vec::new();
    for (cache_key, entry) in state.queries() {
        let subscribers = state.subscribers(cache_key).filter(|subs| !subs.is_empty());
        let Some(subscribers) = subscribers else {
            if default {
                plan.push(Refresh::Remove(cache_key.clone()));
            }
            continue;
        };

        let opted_in = subscribers
            .values()
            .any(|options| trigger.opted(options) == Some(true));
        let undecided = subscribers
            .values()
            .all(|options| trigger.opted(options).is_none());
        if !(opted_in || (undecided && default)) {
            continue;
        }
        if entry.status == QueryStatus::Uninitialized {
            continue;
        }
        plan.push(Refresh::Refetch {
            endpoint: entry.endpoint.clone(),
            args: entry.original_args.clone(),
        });
    }
    plan
}

/// Running environment listener returned by [`setup_listeners`].
#[derive(Debug)]
pub struct ListenerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the listener and wait for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

/// Feed environment signals from `signals` into `engine` until the stream
/// ends or the returned handle is stopped.
pub fn setup_listeners<S>(engine: &QueryEngine, signals: S) -> ListenerHandle
where
    S: Stream<Item = EnvironmentSignal> + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let weak = engine.downgrade();
    let task = engine.runtime().spawn(async move {
        let mut signals = Box::pin(signals);
        loop {
            let signal = tokio::select! {
                _ = cancelled.cancelled() => break,
                next = signals.next() => next,
            };
            let Some(signal) = signal else {
                break;
            };
            let Some(engine) = weak.upgrade() else {
                break;
            };
            engine.signal(signal);
        }
        debug!("Environment listener stopped");
    });
    ListenerHandle { token, task }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;
    use tokio::time::Instant;

    use super::*;
    use crate::cache::endpoint::Api;
    use crate::cache::keys::RequestId;

    fn fulfilled_entry(state: &mut ApiState, key: &str, options: Option<SubscriptionOptions>) {
        let cache_key = CacheKey::from(key);
        let request_id = RequestId::new();
        let api = Api::default();
        state.apply(
            &Action::QueryPending {
                cache_key: cache_key.clone(),
                endpoint: "feed".to_string(),
                args: Payload::from(key),
                request_id,
                subscribe: options.is_some(),
                options: options.unwrap_or_default(),
                forced: false,
                started_at: OffsetDateTime::now_utc(),
            },
            &api,
        );
        state.apply(
            &Action::QueryFulfilled {
                cache_key,
                request_id,
                data: Payload::from(1),
                meta: None,
                provided_tags: Vec::new(),
                fulfilled_at: OffsetDateTime::now_utc(),
                received_at: Instant::now(),
            },
            &api,
        );
    }

    #[test]
    fn explicit_opt_in_beats_disabled_default() {
        let mut state = ApiState::default();
        fulfilled_entry(
            &mut state,
            "a",
            Some(SubscriptionOptions::default().refetch_on_focus(true)),
        );
        fulfilled_entry(&mut state, "b", Some(SubscriptionOptions::default()));

        let plan = plan_refresh(&state, Trigger::Focus);
        assert_eq!(plan.len(), 1);
        assert!(matches!(&plan[0], Refresh::Refetch { args, .. } if args.as_str() == Some("a")));
    }

    #[test]
    fn explicit_opt_out_blocks_default() {
        let mut state = ApiState::new(crate::cache::state::ConfigState {
            refetch_on_reconnect: true,
            ..Default::default()
        });
        fulfilled_entry(
            &mut state,
            "a",
            Some(SubscriptionOptions::default().refetch_on_reconnect(false)),
        );
        fulfilled_entry(&mut state, "b", Some(SubscriptionOptions::default()));
        fulfilled_entry(&mut state, "c", None);

        let plan = plan_refresh(&state, Trigger::Reconnect);
        let refetched: Vec<_> = plan
            .iter()
            .filter_map(|step| match step {
                Refresh::Refetch { args, .. } => args.as_str(),
                Refresh::Remove(_) => None,
            })
            .collect();
        assert_eq!(refetched, vec!["b"]);
        assert!(
            plan.iter()
                .any(|step| matches!(step, Refresh::Remove(key) if key.as_str() == "c"))
        );
    }

    #[test]
    fn unsubscribed_entries_stay_when_default_is_off() {
        let mut state = ApiState::default();
        fulfilled_entry(&mut state, "c", None);
        assert!(plan_refresh(&state, Trigger::Focus).is_empty());
    }
}
