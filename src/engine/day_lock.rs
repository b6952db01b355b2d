use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::warn;
use ulid::Ulid;

use crate::observability::{LOCK_TIMEOUTS_TOTAL, LOCK_WAIT_SECONDS};

use super::EngineError;

/// One mutual-exclusion domain: a staff member's local calendar day.
///
/// Field order matters: the derived `Ord` is the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayKey {
    pub business_id: Ulid,
    pub staff_id: Ulid,
    pub day: NaiveDate,
}

/// Holds every day lock of one operation. Dropping it releases them all.
#[derive(Debug)]
pub struct DayLockGuard {
    keys: Vec<DayKey>,
    _held: Vec<OwnedMutexGuard<()>>,
}

impl DayLockGuard {
    pub fn keys(&self) -> &[DayKey] {
        &self.keys
    }
}

/// Lazily created, in-process mutexes keyed by [`DayKey`].
#[derive(Default)]
pub struct DayLockManager {
    locks: DashMap<DayKey, Arc<Mutex<()>>>,
}

impl DayLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, key: DayKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Lock every day of one staff member. See [`acquire_keys`](Self::acquire_keys).
    pub async fn acquire(
        &self,
        business_id: Ulid,
        staff_id: Ulid,
        days: &[NaiveDate],
        timeout: Duration,
    ) -> Result<DayLockGuard, EngineError> {
        let keys = days
            .iter()
            .map(|&day| DayKey {
                business_id,
                staff_id,
                day,
            })
            .collect();
        self.acquire_keys(keys, timeout).await
    }

    /// Acquire all `keys` in ascending order under one shared deadline.
    /// Either every lock is held on return or none is.
    pub async fn acquire_keys(
        &self,
        mut keys: Vec<DayKey>,
        timeout: Duration,
    ) -> Result<DayLockGuard, EngineError> {
        keys.sort_unstable();
        keys.dedup();

        let started = Instant::now();
        let deadline = started + timeout;
        let mut held = Vec::with_capacity(keys.len());
        for key in &keys {
            let mutex = self.mutex_for(*key);
            match tokio::time::timeout_at(deadline, mutex.lock_owned()).await {
                Ok(guard) => held.push(guard),
                Err(_) => {
                    metrics::counter!(LOCK_TIMEOUTS_TOTAL).increment(1);
                    warn!(
                        staff_id = %key.staff_id,
                        day = %key.day,
                        timeout_ms = timeout.as_millis() as u64,
                        "day lock wait timed out"
                    );
                    return Err(EngineError::LockTimeout);
                }
            }
        }
        metrics::histogram!(LOCK_WAIT_SECONDS).record(started.elapsed().as_secs_f64());

        Ok(DayLockGuard { keys, _held: held })
    }

    /// Run `f` while holding the lock for one staff-day.
    pub async fn with_staff_day_lock<T, F, Fut>(
        &self,
        business_id: Ulid,
        staff_id: Ulid,
        day: NaiveDate,
        timeout: Duration,
        f: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let _guard = self.acquire(business_id, staff_id, &[day], timeout).await?;
        f().await
    }

    /// Drop idle locks for days before `before`. Locks someone holds or is
    /// waiting on are kept. Returns how many were removed.
    pub fn prune(&self, before: NaiveDate) -> usize {
        let len_before = self.locks.len();
        self.locks
            .retain(|key, mutex| key.day >= before || Arc::strong_count(mutex) > 1);
        len_before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
