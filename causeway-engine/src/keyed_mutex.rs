//! Per-key asynchronous locks
//!
//! Serializes work per key without a global lock: `lock(key)` creates or
//! joins the mutex for that key, and the entry is removed once the last
//! holder or waiter is gone. Used to coalesce concurrent session recovery
//! attempts for the same session id.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    waiters: usize,
}

/// A map of lazily created, reference-counted async mutexes
pub struct KeyedMutex<K> {
    slots: Mutex<HashMap<K, Slot>>,
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `key`, waiting if another task holds it
    pub async fn lock(&self, key: K) -> KeyedMutexGuard<'_, K> {
        let lock = {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                lock: Arc::new(AsyncMutex::new(())),
                waiters: 0,
            });
            slot.waiters += 1;
            slot.lock.clone()
        };
        let guard = lock.lock_owned().await;
        KeyedMutexGuard {
            owner: self,
            key,
            _guard: guard,
        }
    }

    /// Number of keys with live holders or waiters
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &K) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(key) {
            slot.waiters -= 1;
            if slot.waiters == 0 {
                slots.remove(key);
            }
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard holding one key's lock; released on drop
pub struct KeyedMutexGuard<'a, K: Eq + Hash + Clone> {
    owner: &'a KeyedMutex<K>,
    key: K,
    _guard: OwnedMutexGuard<()>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedMutexGuard<'_, K> {
    fn drop(&mut self) {
        self.owner.release(&self.key);
    }
}
