use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<G>(
    poisoned: PoisonError<G>,
    source: &'static str,
    op: &'static str,
    lock_kind: &'static str,
) -> G {
    warn!(
        op,
        source,
        lock_kind,
        result = "poisoned_recovered",
        "Recovered from poisoned engine lock; a listener or fetcher panicked while holding it"
    );
    poisoned.into_inner()
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(poisoned, source, op, "rwlock.read"))
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(poisoned, source, op, "rwlock.write"))
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    source: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, source, op, "mutex.lock"))
}
