use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Entries beyond this count trigger a sweep of locks nobody holds.
const PRUNE_THRESHOLD: usize = 1024;

/// Hands out one async mutex per key.
///
/// Multi-key acquisition goes through [`LockFactory::acquire_ordered`], which
/// always takes keys in ascending order. Any two callers with overlapping key
/// sets therefore contend in the same relative order and cannot deadlock.
#[derive(Default)]
pub struct LockFactory {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `key`, created on first use.
    pub fn get_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() >= PRUNE_THRESHOLD {
            // Only the map references an idle lock.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Lock every key (duplicates collapsed) in ascending order.
    /// The returned guard releases them in reverse order when dropped.
    pub async fn acquire_ordered<I, S>(&self, keys: I) -> OrderedLockGuard
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ordered: BTreeSet<String> = keys.into_iter().map(Into::into).collect();
        let mut guard = OrderedLockGuard {
            keys: Vec::with_capacity(ordered.len()),
            guards: Vec::with_capacity(ordered.len()),
        };
        for key in ordered {
            let lock = self.get_lock(&key);
            // If this future is dropped mid-way, `guard` drops too and
            // releases whatever was already taken.
            guard.guards.push(lock.lock_owned().await);
            guard.keys.push(key);
        }
        guard
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a set of per-key locks taken in ascending key order.
pub struct OrderedLockGuard {
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl OrderedLockGuard {
    /// Keys in the order they were acquired.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for OrderedLockGuard {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquires_in_sorted_order_without_duplicates() {
        let factory = LockFactory::new();
        let guard = factory.acquire_ordered(["b", "a", "c", "a"]).await;
        assert_eq!(guard.keys(), &["a", "b", "c"]);
    }

    #[tokio::test]
    async fn held_key_blocks_other_acquirers() {
        let factory = Arc::new(LockFactory::new());
        let guard = factory.acquire_ordered(["q1"]).await;

        let f = factory.clone();
        let waiter = tokio::spawn(async move {
            let _g = f.acquire_ordered(["q2", "q1"]).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn released_after_drop() {
        let factory = LockFactory::new();
        {
            let _g = factory.acquire_ordered(["x", "y"]).await;
        }
        assert!(factory.get_lock("x").try_lock().is_ok());
        assert!(factory.get_lock("y").try_lock().is_ok());
    }

    #[tokio::test]
    async fn idle_locks_are_pruned() {
        let factory = LockFactory::new();
        for i in 0..PRUNE_THRESHOLD {
            let _ = factory.get_lock(&format!("k{}", i));
        }
        // Reaching the threshold sweeps every idle entry.
        let held = factory.acquire_ordered(["held"]).await;
        let _ = factory.get_lock("fresh");
        assert_eq!(factory.len(), 2);
        drop(held);
    }
}
