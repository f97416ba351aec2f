//! Named per-ingress locking
//!
//! Every mutation of an ingress during renewal happens under a lock keyed by
//! the ingress identity (`namespace/name`). The table hands out two modes:
//! a non-blocking [`LockTable::try_lock`] used when a renewal is attempted
//! (contention means someone else is already renewing, so skip), and a
//! blocking [`LockTable::lock`] used when the force-HTTPS annotation must be
//! restored no matter what (restoration may never be skipped).
//!
//! Locks for distinct keys are fully independent. Unlocking a key that is
//! not held is a no-op.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Table of named async locks
///
/// Guards are stored inside the table rather than returned to callers, so the
/// acquire and release sites can live in different scopes (the renewal state
/// machine releases between its annotation-removal and annotation-restore
/// phases).
#[derive(Default)]
pub struct LockTable {
    mutexes: DashMap<String, Arc<Mutex<()>>>,
    guards: DashMap<String, OwnedMutexGuard<()>>,
}

impl LockTable {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.mutexes
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the lock for `key`, waiting until it is free
    ///
    /// Used on paths that must run eventually, like restoring the
    /// force-HTTPS annotation after a renewal window closes.
    pub async fn lock(&self, key: &str) {
        let mutex = self.mutex_for(key);
        let guard = mutex.lock_owned().await;
        self.guards.insert(key.to_string(), guard);
    }

    /// Try to acquire the lock for `key` without waiting
    ///
    /// Returns `true` if the lock was acquired. A `false` means another
    /// worker holds the key right now.
    pub fn try_lock(&self, key: &str) -> bool {
        let mutex = self.mutex_for(key);
        match mutex.try_lock_owned() {
            Ok(guard) => {
                self.guards.insert(key.to_string(), guard);
                true
            }
            Err(_) => false,
        }
    }

    /// Release the lock for `key`
    ///
    /// No-op when the key is not currently held.
    pub fn unlock(&self, key: &str) {
        self.guards.remove(key);
    }

    /// Whether `key` is currently held
    pub fn is_locked(&self, key: &str) -> bool {
        self.guards.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn try_lock_grants_exactly_one_winner() {
        let table = Arc::new(LockTable::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(
                async move { table.try_lock("default/web") },
            ));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
        assert!(table.is_locked("default/web"));
    }

    #[tokio::test]
    async fn unlock_frees_the_key_for_the_next_worker() {
        let table = LockTable::new();

        assert!(table.try_lock("default/web"));
        assert!(!table.try_lock("default/web"));

        table.unlock("default/web");
        assert!(!table.is_locked("default/web"));
        assert!(table.try_lock("default/web"));
    }

    #[tokio::test]
    async fn unlock_of_unheld_key_is_a_noop() {
        let table = LockTable::new();

        table.unlock("never/held");
        assert!(!table.is_locked("never/held"));

        // A later acquisition still works normally
        assert!(table.try_lock("never/held"));
        table.unlock("never/held");
        table.unlock("never/held");
        assert!(table.try_lock("never/held"));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let table = LockTable::new();

        assert!(table.try_lock("default/web"));
        assert!(table.try_lock("default/api"));
        assert!(table.try_lock("shop/storefront"));

        assert!(table.is_locked("default/web"));
        assert!(table.is_locked("default/api"));
        assert!(table.is_locked("shop/storefront"));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_lock_waits_for_release() {
        let table = Arc::new(LockTable::new());
        assert!(table.try_lock("default/web"));

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                table.lock("default/web").await;
            })
        };

        // Give the waiter a chance to park on the mutex
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        table.unlock("default/web");
        waiter.await.unwrap();
        assert!(table.is_locked("default/web"));
    }
}
