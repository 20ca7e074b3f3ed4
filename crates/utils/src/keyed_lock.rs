//! Per-key async mutual exclusion
//!
//! Operations that share a key run one after another while operations on
//! different keys proceed concurrently. Entries are dropped from the table as
//! soon as the last holder or waiter for a key goes away, so the table only
//! ever contains keys that are in use.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

type LockTable<K> = Arc<DashMap<K, Weak<Mutex<()>>>>;

/// Guard returned by [`KeyedMutex::lock`]. Releases the key on drop.
pub struct KeyedMutexGuard<K>
where
    K: Hash + Eq + Clone,
{
    guard: Option<OwnedMutexGuard<()>>,
    mutex: Arc<Mutex<()>>,
    key: K,
    table: LockTable<K>,
}

impl<K> Drop for KeyedMutexGuard<K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());

        // only `self.mutex` left: nobody is waiting on this key
        if Arc::strong_count(&self.mutex) == 1 {
            self.table
                .remove_if(&self.key, |_, weak| weak.strong_count() <= 1);
        }
    }
}

/// Table of async mutexes indexed by key.
///
/// ```rust,ignore
/// let locks = KeyedMutex::<String>::new();
/// let _guard = locks.lock(&"acme".to_string()).await;
/// // registration work for vendor "acme" happens here
/// ```
pub struct KeyedMutex<K>
where
    K: Hash + Eq + Clone,
{
    table: LockTable<K>,
}

impl<K> KeyedMutex<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            table: Arc::new(DashMap::new()),
        }
    }

    /// Waits until no one else holds `key`, then holds it until the guard drops.
    pub async fn lock(&self, key: &K) -> KeyedMutexGuard<K> {
        let mutex = self.mutex_for(key);
        let guard = Arc::clone(&mutex).lock_owned().await;

        KeyedMutexGuard {
            guard: Some(guard),
            mutex,
            key: key.clone(),
            table: Arc::clone(&self.table),
        }
    }

    fn mutex_for(&self, key: &K) -> Arc<Mutex<()>> {
        loop {
            match self.table.entry(key.clone()) {
                Entry::Occupied(occupied) => {
                    if let Some(mutex) = occupied.get().upgrade() {
                        return mutex;
                    }
                    // stale entry left behind by a guard that raced us
                    occupied.remove();
                }
                Entry::Vacant(vacant) => {
                    let mutex = Arc::new(Mutex::new(()));
                    vacant.insert(Arc::downgrade(&mutex));
                    return mutex;
                }
            }
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl<K> Default for KeyedMutex<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
