use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

/// Lock helpers that never propagate poisoning.
///
/// A panic while a region lock is held leaves the map in whatever state the
/// panicking thread produced. Every cache operation is idempotent at the
/// entry level, so the guard is recovered and the caller proceeds.
fn recover<G>(poisoned: PoisonError<G>, region: &str, op: &'static str, kind: &'static str) -> G {
    warn!(
        region,
        op,
        lock_kind = kind,
        result = "poisoned_recovered",
        "Recovered from poisoned cache lock"
    );
    poisoned.into_inner()
}

pub(crate) fn read<'a, T>(lock: &'a RwLock<T>, region: &str, op: &'static str) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(poisoned, region, op, "rwlock.read"))
}

pub(crate) fn write<'a, T>(lock: &'a RwLock<T>, region: &str, op: &'static str) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(poisoned, region, op, "rwlock.write"))
}

pub(crate) fn exclusive<'a, T>(lock: &'a Mutex<T>, region: &str, op: &'static str) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, region, op, "mutex.lock"))
}
