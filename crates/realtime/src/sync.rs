use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A map of independently awaitable mutexes, one per key.
///
/// Used to serialize message sends per conversation and receipt processing
/// per (reader, conversation) without a global lock. Entries are created on
/// first use and never reclaimed; the key space here is bounded by active
/// conversations.
pub(crate) struct KeyedLocks<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    pub(crate) async fn acquire(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}
