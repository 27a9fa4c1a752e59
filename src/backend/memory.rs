//! In-memory storage backend.
//!
//! Provides a fast, non-persistent transactional engine. Databases live in a
//! DashMap; each database guards its collections with a single lock so that
//! a commit applies all staged writes at once.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::transaction::{StagedWrite, TransactionCore};
use super::types::{TransactionMode, TransactionOutcome, Value};
use super::{Backend, Connection, Transaction};
use crate::error::{BackendError, BackendErrorKind};

type Collections = HashMap<String, BTreeMap<String, Value>>;

/// In-memory transactional backend.
///
/// All data is lost when the last clone is dropped. Ideal for:
/// - Testing and development
/// - Embedded applications that only need the resilience layer
///
/// # Example
///
/// ```ignore
/// use steadykv::backend::MemoryBackend;
///
/// let backend = MemoryBackend::new();
/// let store = Store::builder(Arc::new(backend), "app", "prefs").open().await;
/// ```
#[derive(Clone, Default)]
pub struct MemoryBackend {
    databases: Arc<DashMap<String, Arc<RwLock<Collections>>>>,
    connections: Arc<Mutex<Vec<Weak<MemoryConnection>>>>,
}

impl MemoryBackend {
    /// Creates a new empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes every open connection, as an engine does when it shuts a
    /// database down on its own.
    ///
    /// Returns the number of connections that were closed.
    pub fn close_connections(&self) -> usize {
        let mut connections = self.connections.lock();
        let mut closed = 0;
        for connection in connections.drain(..).filter_map(|weak| weak.upgrade()) {
            if !connection.closed.swap(true, Ordering::SeqCst) {
                closed += 1;
            }
        }
        closed
    }

    /// Committed entries of a collection, if it exists.
    pub fn entries(&self, database: &str, collection: &str) -> Option<BTreeMap<String, Value>> {
        let data = self.databases.get(database)?.value().clone();
        let collections = data.read();
        collections.get(collection).cloned()
    }

    /// Writes an entry directly, bypassing transactions.
    pub fn insert(&self, database: &str, collection: &str, key: &str, value: Value) {
        let data = self.database(database);
        data.write()
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn database(&self, name: &str) -> Arc<RwLock<Collections>> {
        self.databases
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn open(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<Arc<dyn Connection>, BackendError> {
        let data = self.database(database);
        data.write().entry(collection.to_string()).or_default();

        let connection = Arc::new(MemoryConnection {
            data,
            closed: AtomicBool::new(false),
        });

        let mut connections = self.connections.lock();
        connections.retain(|weak| weak.strong_count() > 0);
        connections.push(Arc::downgrade(&connection));

        Ok(connection)
    }

    async fn list_databases(&self) -> Result<Vec<String>, BackendError> {
        let mut names: Vec<String> = self
            .databases
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

struct MemoryConnection {
    data: Arc<RwLock<Collections>>,
    closed: AtomicBool,
}

impl Connection for MemoryConnection {
    fn transaction(
        &self,
        collection: &str,
        mode: TransactionMode,
    ) -> Result<Arc<dyn Transaction>, BackendError> {
        if self.is_closed() {
            return Err(BackendError::closed());
        }
        if !self.data.read().contains_key(collection) {
            return Err(BackendError::new(
                BackendErrorKind::NotFound,
                format!("No collection named '{collection}'"),
            ));
        }

        Ok(Arc::new(MemoryTransaction {
            data: self.data.clone(),
            collection: collection.to_string(),
            core: TransactionCore::new(mode),
            snapshot: Mutex::new(None),
        }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MemoryTransaction {
    data: Arc<RwLock<Collections>>,
    collection: String,
    core: TransactionCore,
    /// Committed entries as of the first read.
    snapshot: Mutex<Option<BTreeMap<String, Value>>>,
}

impl MemoryTransaction {
    fn with_committed<R>(&self, read: impl FnOnce(&BTreeMap<String, Value>) -> R) -> R {
        let mut snapshot = self.snapshot.lock();
        let committed = snapshot.get_or_insert_with(|| {
            self.data
                .read()
                .get(&self.collection)
                .cloned()
                .unwrap_or_default()
        });
        read(committed)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn mode(&self) -> TransactionMode {
        self.core.mode()
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        self.core.ensure_active()?;
        let committed = self.with_committed(|entries| entries.get(key).cloned());
        Ok(self.core.overlay_value(key, committed))
    }

    async fn get_all(&self) -> Result<Vec<Value>, BackendError> {
        self.core.ensure_active()?;
        let committed = self.with_committed(Clone::clone);
        Ok(self.core.overlay_all(committed).into_values().collect())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, BackendError> {
        self.core.ensure_active()?;
        let committed = self.with_committed(Clone::clone);
        Ok(self.core.overlay_all(committed).into_keys().collect())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), BackendError> {
        self.core.stage(StagedWrite::Put(key.to_string(), value))
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.core.stage(StagedWrite::Clear)
    }

    async fn commit(&self) -> TransactionOutcome {
        let writes = match self.core.begin_commit() {
            Ok(writes) => writes,
            Err(outcome) => return outcome,
        };

        let outcome = {
            let mut collections = self.data.write();
            match collections.get_mut(&self.collection) {
                Some(entries) => {
                    for write in writes {
                        write.apply(entries);
                    }
                    TransactionOutcome::Complete
                },
                None => TransactionOutcome::Failed(BackendError::new(
                    BackendErrorKind::NotFound,
                    format!("No collection named '{}'", self.collection),
                )),
            }
        };

        self.core.finish(outcome.clone());
        outcome
    }

    fn abort(&self) -> Result<(), BackendError> {
        self.core.abort()
    }

    async fn done(&self) -> TransactionOutcome {
        self.core.done().await
    }
}
