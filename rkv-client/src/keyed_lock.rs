//! # Keyed Locks
//!
//! Purpose: One async lock per key (table, stub endpoint) without keeping a lock
//! for every key ever seen.
//!
//! ## Design Principles
//! 1. **Lazy Entries**: A key's lock is created by its first caller.
//! 2. **Self-Pruning**: When a guard is dropped and no other task holds or waits on
//!    the same lock, the entry is removed. Clones are only taken under the map
//!    lock, so the reference count checked there is exact.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map of per-key async locks.
#[derive(Debug)]
pub(crate) struct KeyedLocks<K: Eq + Hash + Clone> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        KeyedLocks {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Waits for the lock of `key`.
    pub(crate) async fn lock(&self, key: &K) -> KeyedGuard<'_, K> {
        let lock = self
            .locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = lock.clone().lock_owned().await;
        KeyedGuard {
            owner: self,
            key: key.clone(),
            lock,
            guard: Some(guard),
        }
    }

    /// Number of keys with a live lock.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }

    fn release(&self, key: &K, lock: &Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock();
        let unused = matches!(
            locks.get(key),
            // One reference in the map, one in the releasing guard.
            Some(current) if Arc::ptr_eq(current, lock) && Arc::strong_count(lock) == 2
        );
        if unused {
            locks.remove(key);
        }
    }
}

/// Holds one key's lock; prunes the entry on drop if nobody else needs it.
pub(crate) struct KeyedGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedLocks<K>,
    key: K,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<'_, K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.owner.release(&self.key, &self.lock);
    }
}
