//! Fallback cache shadowing the backend.
//!
//! Each (database, collection) pair has one [`FallbackCache`], handed out by
//! a [`CacheRegistry`]. Every store built for the same pair shares it, so a
//! cache outlives the store that filled it for the rest of the process.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use crate::backend::Value;

/// In-process key/value mirror of one collection.
///
/// Unbounded. Every method takes the lock once, so each call is atomic with
/// respect to the others.
#[derive(Debug, Default)]
pub struct FallbackCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl FallbackCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    /// Looks up every key; missing ones map to `None`.
    pub fn get_many(&self, keys: &[String]) -> HashMap<String, Option<Value>> {
        let entries = self.entries.read();
        keys.iter()
            .map(|key| (key.clone(), entries.get(key).cloned()))
            .collect()
    }

    pub fn insert_many(&self, items: impl IntoIterator<Item = (String, Value)>) {
        self.entries.write().extend(items);
    }

    /// Records the result of a backend read: present values are upserted
    /// and keys the backend reported absent are removed.
    pub fn apply_fetched(&self, fetched: &HashMap<String, Option<Value>>) {
        let mut entries = self.entries.write();
        for (key, value) in fetched {
            match value {
                Some(value) => {
                    entries.insert(key.clone(), value.clone());
                },
                None => {
                    entries.remove(key);
                },
            }
        }
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Makes the cache mirror `remote`.
    ///
    /// Keys missing from `remote` are deleted and every remote entry is
    /// upserted, all under one write lock so no reader sees a half-merged
    /// cache.
    pub fn replace_all(&self, remote: Vec<(String, Value)>) {
        let remote_keys: HashSet<&str> = remote.iter().map(|(key, _)| key.as_str()).collect();
        let mut entries = self.entries.write();
        entries.retain(|key, _| remote_keys.contains(key.as_str()));
        for (key, value) in remote {
            entries.insert(key, value);
        }
    }

    /// Sorted copy of the current entries.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries
            .read()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

static GLOBAL: LazyLock<Arc<CacheRegistry>> = LazyLock::new(|| Arc::new(CacheRegistry::new()));

/// Registry of fallback caches keyed by (database, collection).
///
/// Stores use the process-wide [`CacheRegistry::global`] unless another
/// registry is injected, which keeps tests isolated from each other.
#[derive(Debug, Default)]
pub struct CacheRegistry {
    caches: DashMap<(String, String), Arc<FallbackCache>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first access.
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    /// Cache for the pair, created empty on first access.
    pub fn get_or_create(&self, database: &str, collection: &str) -> Arc<FallbackCache> {
        self.caches
            .entry((database.to_string(), collection.to_string()))
            .or_default()
            .value()
            .clone()
    }

    /// Drops the cache of the pair. Stores still holding it keep their copy.
    pub fn remove(&self, database: &str, collection: &str) -> Option<Arc<FallbackCache>> {
        self.caches
            .remove(&(database.to_string(), collection.to_string()))
            .map(|(_, cache)| cache)
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}
