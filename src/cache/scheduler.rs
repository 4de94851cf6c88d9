//! Keyed one-shot timers for cache collection and polling.
//!
//! Each key owns at most one armed timer. Re-arming a key aborts the previous
//! timer; a timer only runs its callback if it is still the key's current one.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

use super::state::MAX_TIMER_DELAY;

struct Slot {
    deadline: Instant,
    generation: u64,
    task: Option<AbortHandle>,
}

pub(crate) struct Timers<K> {
    name: &'static str,
    slots: Arc<DashMap<K, Slot>>,
    generation: AtomicU64,
    runtime: Handle,
}

impl<K> Timers<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Display + 'static,
{
    pub(crate) fn new(name: &'static str, runtime: Handle) -> Self {
        Self {
            name,
            slots: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            runtime,
        }
    }

    /// Arm (or re-arm) the timer for `key`.
    pub(crate) fn schedule_at<F>(&self, key: K, deadline: Instant, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.slots.insert(
            key.clone(),
            Slot {
                deadline,
                generation,
                task: None,
            },
        );
        if let Some(task) = previous.and_then(|slot| slot.task) {
            task.abort();
        }

        let slots = Arc::clone(&self.slots);
        let fired_key = key.clone();
        let timer = self.name;
        let join = self.runtime.spawn(async move {
            sleep_until(deadline).await;
            if slots
                .remove_if(&fired_key, |_, slot| slot.generation == generation)
                .is_some()
            {
                trace!(timer, key = %fired_key, "Timer fired");
                callback();
            }
        });

        // The task may already have fired (zero delay); only attach the abort
        // handle to the slot it was spawned for.
        if let Some(mut slot) = self.slots.get_mut(&key) {
            if slot.generation == generation {
                slot.task = Some(join.abort_handle());
            }
        }
    }

    pub(crate) fn schedule_in<F>(&self, key: K, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(key, deadline_after(delay), callback);
    }

    pub(crate) fn cancel(&self, key: &K) -> bool {
        match self.slots.remove(key) {
            Some((_, slot)) => {
                if let Some(task) = slot.task {
                    task.abort();
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn deadline(&self, key: &K) -> Option<Instant> {
        self.slots.get(key).map(|slot| slot.deadline)
    }

    pub(crate) fn clear(&self) {
        self.slots.retain(|_, slot| {
            if let Some(task) = slot.task.take() {
                task.abort();
            }
            false
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// `now + delay`, saturating to [`MAX_TIMER_DELAY`] where the clock cannot
/// represent the sum.
pub(crate) fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(MAX_TIMER_DELAY))
        .unwrap_or(now)
}
