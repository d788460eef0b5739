use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockKey = (String, String);

/// Process-local exclusive locks on `(scope, key)` pairs.
///
/// Locks are held through a [`LockGuard`]; dropping the guard releases the
/// lock on every exit path, including `?` returns, panics and cancelled
/// futures. Distinct pairs never contend. Locks are not reentrant: acquiring a
/// pair already held by the current task waits forever.
#[derive(Debug, Default)]
pub struct SingletonLocker {
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl SingletonLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `(scope, key)` is free and take it.
    pub async fn lock(&self, scope: &str, key: &str) -> LockGuard {
        let lock_key = (scope.to_string(), key.to_string());
        let mutex = self
            .locks
            .entry(lock_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        // The shard guard above is released before waiting
        let guard = mutex.lock_owned().await;
        trace!("Acquired lock {}/{}", lock_key.0, lock_key.1);

        LockGuard {
            guard: Some(guard),
            key: lock_key,
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of pairs currently held or waited on.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive hold on one `(scope, key)` pair. Released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: LockKey,
    locks: Arc<DashMap<LockKey, Arc<Mutex<()>>>>,
}

impl LockGuard {
    pub fn scope(&self) -> &str {
        &self.key.0
    }

    pub fn key(&self) -> &str {
        &self.key.1
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table still references the mutex when nobody waits on it.
        // remove_if holds the shard lock, so no waiter can clone it meanwhile.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        trace!("Released lock {}/{}", self.key.0, self.key.1);
    }
}
