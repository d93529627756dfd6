use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// One mutex per key (a domain for the revision counter, a document directory
/// for writes and deletes). Serializes callers inside this process only.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_lock<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        // The mutex guards no data, so a poisoned lock is still usable.
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Run `f` while holding the locks for every key. Keys are taken in
    /// sorted order, so two callers with overlapping keys cannot deadlock.
    pub fn with_locks<R>(&self, mut keys: Vec<String>, f: impl FnOnce() -> R) -> R {
        keys.sort();
        keys.dedup();
        self.with_sorted_locks(&keys, f)
    }

    fn with_sorted_locks<R>(&self, keys: &[String], f: impl FnOnce() -> R) -> R {
        match keys.split_first() {
            None => f(),
            Some((first, rest)) => self.with_lock(first, || self.with_sorted_locks(rest, f)),
        }
    }

    /// Drop the lock entry for a key whose resource no longer exists.
    /// Entries still held or awaited by another caller are kept.
    pub fn forget(&self, key: &str) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
