//! Map with per-entry activity timestamps and timeout eviction
//!
//! Backs the proxy pool's flow map, remote-endpoint set, and worker
//! destination maps. Every read access refreshes the entry's timestamp;
//! [`TimeoutMap::cleanup`] evicts entries idle past the configured timeout.
//! With `V = ()` the map doubles as a timeout set.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    last_access: Instant,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    timeout: Duration,
}

/// A mutex-guarded map whose entries expire after a period of inactivity
pub struct TimeoutMap<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TimeoutMap<K, V> {
    /// Create a map with the given entry timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                timeout,
            }),
        }
    }

    /// Change the entry timeout; effective for the next cleanup pass
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.lock().unwrap().timeout = timeout;
    }

    /// The current entry timeout
    pub fn timeout(&self) -> Duration {
        self.inner.lock().unwrap().timeout
    }

    /// Insert a value, returning the previous one if present
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .insert(
                key,
                Entry {
                    value,
                    last_access: Instant::now(),
                },
            )
            .map(|entry| entry.value)
    }

    /// Look up a value, refreshing its timestamp
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(key)?;
        entry.last_access = Instant::now();
        Some(entry.value.clone())
    }

    /// Check for a key without refreshing its timestamp
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().unwrap().entries.contains_key(key)
    }

    /// Look up a value or insert one from the factory.
    ///
    /// The factory runs at most once per missing key; concurrent callers
    /// serialize on the map lock.
    pub fn get_or_insert_with<F: FnOnce() -> V>(&self, key: K, factory: F) -> V {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.entry(key).or_insert_with(|| Entry {
            value: factory(),
            last_access: Instant::now(),
        });
        entry.last_access = Instant::now();
        entry.value.clone()
    }

    /// Remove an entry
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .remove(key)
            .map(|entry| entry.value)
    }

    /// Evict entries idle past the timeout, returning the evicted pairs
    pub fn cleanup(&self) -> Vec<(K, V)> {
        let mut inner = self.inner.lock().unwrap();
        let timeout = inner.timeout;
        let now = Instant::now();
        let expired: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_access) > timeout)
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                inner
                    .entries
                    .remove(&key)
                    .map(|entry| (key.clone(), entry.value))
            })
            .collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Check whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all entries
    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }
}
