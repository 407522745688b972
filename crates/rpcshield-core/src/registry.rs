//! Lazily-populated map from a key to one shared instance.
//!
//! Thread-safe via `RwLock<HashMap<K, Arc<V>>>`. Lookups of existing keys
//! take the read lock; creation re-checks under the write lock so concurrent
//! first accesses to the same key construct exactly one instance. The lock
//! is held only for the map operation. Callers get an `Arc<V>` and use the
//! instance (which has its own lock) after the registry lock is released.

use std::borrow::Borrow;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct KeyedRegistry<K, V> {
    inner: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> KeyedRegistry<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the instance for `key`, constructing it with `factory` if the
    /// key has not been seen.
    ///
    /// `factory` runs at most once per key, under the write lock, so it
    /// should be cheap and must not call back into this registry.
    pub fn get_or_create<F>(&self, key: K, factory: F) -> Arc<V>
    where
        F: FnOnce(&K) -> V,
    {
        self.get_or_create_with_flag(key, factory).0
    }

    /// Like [`get_or_create`](Self::get_or_create), also reporting whether
    /// this call constructed the instance.
    pub fn get_or_create_with_flag<F>(&self, key: K, factory: F) -> (Arc<V>, bool)
    where
        F: FnOnce(&K) -> V,
    {
        if let Some(existing) = self.read().get(&key) {
            return (Arc::clone(existing), false);
        }

        let mut map = self.write();
        match map.entry(key) {
            Entry::Occupied(e) => (Arc::clone(e.get()), false),
            Entry::Vacant(e) => {
                let value = Arc::new(factory(e.key()));
                (Arc::clone(e.insert(value)), true)
            }
        }
    }

    /// Returns the instance for `key` without creating one.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.read().get(key).cloned()
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.write().remove(key)
    }

    /// Remove every entry for which `evict` returns `true`, skipping
    /// instances that are still referenced outside the registry.
    ///
    /// Holding the write lock means no new reference can be handed out
    /// while an entry is checked, so an instance in use by a caller is never
    /// removed from under it. Returns the evicted keys.
    pub fn evict_unused<F>(&self, mut evict: F) -> Vec<K>
    where
        K: Clone,
        F: FnMut(&K, &V) -> bool,
    {
        let mut evicted = Vec::new();
        self.write().retain(|key, value| {
            if Arc::strong_count(value) == 1 && evict(key, value) {
                evicted.push(key.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Snapshot of all entries. The registry lock is released before the
    /// snapshot is returned.
    pub fn entries(&self) -> Vec<(K, Arc<V>)>
    where
        K: Clone,
    {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, Arc<V>>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, Arc<V>>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> Default for KeyedRegistry<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for KeyedRegistry<K, V>
where
    K: Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.read().keys()).finish()
    }
}
