use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};
use ulid::Ulid;

use super::EngineError;

/// Exclusive holds on a sorted set of computers. Dropping it releases all.
#[derive(Debug)]
pub struct LockSet {
    holder: Ulid,
    computers: Vec<Ulid>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockSet {
    pub fn holder(&self) -> Ulid {
        self.holder
    }

    pub fn computers(&self) -> &[Ulid] {
        &self.computers
    }
}

/// Short-lived per-computer mutual exclusion for resolve-then-commit.
#[derive(Debug)]
pub struct AllocationLocks {
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl AllocationLocks {
    pub fn new(timeout: Duration) -> Self {
        Self { locks: DashMap::new(), timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Take every hold in `computer_ids` before one shared deadline.
    ///
    /// Ids are sorted and deduplicated so concurrent acquirers always lock in
    /// the same order. On timeout the holds already taken are dropped.
    pub async fn acquire(&self, holder: Ulid, computer_ids: &[Ulid]) -> Result<LockSet, EngineError> {
        let mut ids = computer_ids.to_vec();
        ids.sort();
        ids.dedup();

        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            let mutex = self.locks.entry(*id).or_default().value().clone();
            match tokio::time::timeout_at(deadline, mutex.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    warn!(
                        "holder {holder}: lock timeout on {id} after {} of {} holds",
                        guards.len(),
                        ids.len()
                    );
                    metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                    return Err(EngineError::LockTimeout);
                }
            }
        }
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());
        debug!("holder {holder}: locked {} computers", ids.len());

        Ok(LockSet { holder, computers: ids, _guards: guards })
    }

    /// Run `f` while holding every lock in `computer_ids`.
    ///
    /// Locks are released on every exit path of `f`, including errors.
    pub async fn with_lock<F, Fut, T>(
        &self,
        holder: Ulid,
        computer_ids: &[Ulid],
        f: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let set = self.acquire(holder, computer_ids).await?;
        let result = f().await;
        drop(set);
        result
    }

    /// True if someone currently holds the computer's lock.
    pub fn is_locked(&self, computer_id: &Ulid) -> bool {
        self.locks
            .get(computer_id)
            .is_some_and(|m| m.try_lock().is_err())
    }
}
