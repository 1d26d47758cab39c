//! Per-aggregate mutual exclusion.
//!
//! Every transition that reads state and then writes it runs while holding
//! the lock of each aggregate it touches. Keys are acquired in a fixed order:
//! request, then assignment, then equipment ids in ascending order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;

use campusres_core::AggregateId;

pub type SharedLock = Arc<Mutex<()>>;

/// Lazily created mutex per aggregate id.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<AggregateId, SharedLock>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: AggregateId) -> SharedLock {
        // Clone the Arc out so the shard guard is released before blocking.
        self.locks.entry(key).or_default().clone()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with<R>(&self, key: AggregateId, f: impl FnOnce() -> R) -> R {
        let lock = self.handle(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Run `f` while holding the locks for every key, acquired in ascending
    /// order. Duplicate keys are locked once.
    pub fn with_all<R>(&self, keys: impl IntoIterator<Item = AggregateId>, f: impl FnOnce() -> R) -> R {
        let mut keys: Vec<AggregateId> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let locks: Vec<SharedLock> = keys.into_iter().map(|k| self.handle(k)).collect();
        let _guards: Vec<MutexGuard<'_, ()>> = locks
            .iter()
            .map(|l| l.lock().unwrap_or_else(PoisonError::into_inner))
            .collect();
        f()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
