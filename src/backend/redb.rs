//! Redb-backed storage backend.
//!
//! One redb file per database under a root directory, one table per
//! collection, JSON-encoded values. Redb work is synchronous, so every
//! request runs on `spawn_blocking`.

use async_trait::async_trait;
use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;

use super::transaction::{StagedWrite, TransactionCore};
use super::types::{TransactionMode, TransactionOutcome, Value};
use super::{Backend, Connection, Transaction};
use crate::error::{BackendError, BackendErrorKind};

const DATABASE_EXTENSION: &str = "redb";

fn table(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

fn storage_error(context: &str, err: impl Into<redb::Error>) -> BackendError {
    match err.into() {
        redb::Error::DatabaseAlreadyOpen => BackendError::new(
            BackendErrorKind::Blocked,
            format!("{context}: database is held by another session"),
        ),
        redb::Error::TableDoesNotExist(name) => BackendError::new(
            BackendErrorKind::NotFound,
            format!("{context}: no collection named '{name}'"),
        ),
        other => BackendError::new(BackendErrorKind::Unknown, format!("{context}: {other}")),
    }
}

fn join_error(err: &tokio::task::JoinError) -> BackendError {
    BackendError::new(BackendErrorKind::Unknown, format!("Task join error: {err}"))
}

fn decode(key: &str, bytes: &[u8]) -> Result<Value, BackendError> {
    serde_json::from_slice(bytes).map_err(|e| {
        BackendError::new(
            BackendErrorKind::Data,
            format!("Failed to deserialize entry for key '{key}': {e}"),
        )
    })
}

/// Redb-backed transactional backend.
///
/// Provides persistent storage with ACID guarantees. A database file can be
/// held by a single `RedbBackend` at a time; a second holder gets a
/// `Blocked` error on open.
///
/// # Example
///
/// ```ignore
/// use steadykv::backend::RedbBackend;
///
/// let backend = RedbBackend::new("~/.steadykv/data");
/// let store = Store::builder(Arc::new(backend), "app", "prefs").open().await;
/// ```
#[derive(Clone)]
pub struct RedbBackend {
    root: PathBuf,
    databases: Arc<Mutex<HashMap<String, Arc<Database>>>>,
}

impl RedbBackend {
    /// Creates a backend storing its databases under `root`.
    ///
    /// Nothing is touched on disk until the first open.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            databases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Directory holding the database files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn database_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{DATABASE_EXTENSION}"))
    }

    /// Opens (or reuses) the database file and provisions the collection.
    fn open_sync(&self, database: &str, collection: &str) -> Result<Arc<Database>, BackendError> {
        let db = {
            let mut databases = self.databases.lock();
            match databases.get(database) {
                Some(db) => db.clone(),
                None => {
                    std::fs::create_dir_all(&self.root).map_err(|e| {
                        BackendError::new(
                            BackendErrorKind::Unknown,
                            format!(
                                "Failed to create data directory {}: {e}",
                                self.root.display()
                            ),
                        )
                    })?;
                    let path = self.database_path(database);
                    let db = Database::create(&path).map_err(|e| {
                        storage_error(&format!("Failed to open {}", path.display()), e)
                    })?;
                    let db = Arc::new(db);
                    databases.insert(database.to_string(), db.clone());
                    db
                },
            }
        };

        let provision = || -> Result<(), redb::Error> {
            let write_txn = db.begin_write()?;
            {
                let _table = write_txn.open_table(table(collection))?;
            }
            write_txn.commit()?;
            Ok(())
        };
        provision().map_err(|e| {
            BackendError::new(
                BackendErrorKind::Constraint,
                format!("Failed to provision collection '{collection}': {e}"),
            )
        })?;

        Ok(db)
    }

    fn list_sync(&self) -> Result<Vec<String>, BackendError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BackendError::new(
                    BackendErrorKind::Unknown,
                    format!("Failed to list {}: {e}", self.root.display()),
                ));
            },
        };

        let mut names: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == DATABASE_EXTENSION))
            .filter_map(|path| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl Backend for RedbBackend {
    async fn open(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<Arc<dyn Connection>, BackendError> {
        let backend = self.clone();
        let database = database.to_string();
        let collection = collection.to_string();
        let db = tokio::task::spawn_blocking(move || backend.open_sync(&database, &collection))
            .await
            .map_err(|e| join_error(&e))??;

        Ok(Arc::new(RedbConnection {
            db,
            closed: AtomicBool::new(false),
        }))
    }

    async fn list_databases(&self) -> Result<Vec<String>, BackendError> {
        let backend = self.clone();
        tokio::task::spawn_blocking(move || backend.list_sync())
            .await
            .map_err(|e| join_error(&e))?
    }
}

struct RedbConnection {
    db: Arc<Database>,
    closed: AtomicBool,
}

impl Connection for RedbConnection {
    fn transaction(
        &self,
        collection: &str,
        mode: TransactionMode,
    ) -> Result<Arc<dyn Transaction>, BackendError> {
        if self.is_closed() {
            return Err(BackendError::closed());
        }

        Ok(Arc::new(RedbTransaction {
            db: self.db.clone(),
            collection: collection.to_string(),
            core: Arc::new(TransactionCore::new(mode)),
            snapshot: OnceCell::new(),
        }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct RedbTransaction {
    db: Arc<Database>,
    collection: String,
    core: Arc<TransactionCore>,
    /// Committed entries as of the first read.
    snapshot: OnceCell<Arc<BTreeMap<String, Value>>>,
}

impl RedbTransaction {
    /// Committed entries, read once per transaction on the blocking pool.
    async fn committed(&self) -> Result<Arc<BTreeMap<String, Value>>, BackendError> {
        self.core.ensure_active()?;
        self.snapshot
            .get_or_try_init(|| async {
                let db = self.db.clone();
                let collection = self.collection.clone();
                tokio::task::spawn_blocking(move || Self::read_all(&db, &collection))
                    .await
                    .map_err(|e| join_error(&e))?
                    .map(Arc::new)
            })
            .await
            .cloned()
    }

    fn read_all(db: &Database, collection: &str) -> Result<BTreeMap<String, Value>, BackendError> {
        let read_txn = db
            .begin_read()
            .map_err(|e| storage_error("Failed to begin read transaction", e))?;
        let table = read_txn
            .open_table(table(collection))
            .map_err(|e| storage_error("Failed to open collection", e))?;

        let mut entries = BTreeMap::new();
        for item in table
            .iter()
            .map_err(|e| storage_error("Failed to iterate collection", e))?
        {
            let (key, value) = item.map_err(|e| storage_error("Failed to read entry", e))?;
            let key = key.value().to_string();
            let value = decode(&key, value.value())?;
            entries.insert(key, value);
        }
        Ok(entries)
    }

    fn apply_sync(
        db: &Database,
        collection: &str,
        writes: Vec<(StagedWrite, Option<Vec<u8>>)>,
    ) -> Result<(), BackendError> {
        let write_txn = db
            .begin_write()
            .map_err(|e| storage_error("Failed to begin write transaction", e))?;
        {
            let mut table = write_txn
                .open_table(table(collection))
                .map_err(|e| storage_error("Failed to open collection", e))?;

            for (write, encoded) in writes {
                match (write, encoded) {
                    (StagedWrite::Put(key, _), Some(bytes)) => {
                        table
                            .insert(key.as_str(), bytes.as_slice())
                            .map_err(|e| storage_error(&format!("Failed to insert key '{key}'"), e))?;
                    },
                    (StagedWrite::Clear, _) => {
                        table
                            .retain(|_, _| false)
                            .map_err(|e| storage_error("Failed to clear collection", e))?;
                    },
                    (StagedWrite::Put(key, _), None) => {
                        return Err(BackendError::new(
                            BackendErrorKind::Data,
                            format!("Missing encoded value for key '{key}'"),
                        ));
                    },
                }
            }
        }
        write_txn
            .commit()
            .map_err(|e| storage_error("Failed to commit write transaction", e))
    }
}

#[async_trait]
impl Transaction for RedbTransaction {
    fn mode(&self) -> TransactionMode {
        self.core.mode()
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        let committed = self.committed().await?;
        Ok(self.core.overlay_value(key, committed.get(key).cloned()))
    }

    async fn get_all(&self) -> Result<Vec<Value>, BackendError> {
        let committed = self.committed().await?;
        Ok(self
            .core
            .overlay_all((*committed).clone())
            .into_values()
            .collect())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, BackendError> {
        let committed = self.committed().await?;
        Ok(self
            .core
            .overlay_all((*committed).clone())
            .into_keys()
            .collect())
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

        if writes.is_empty() {
            self.core.finish(TransactionOutcome::Complete);
            return TransactionOutcome::Complete;
        }

        let mut encoded = Vec::with_capacity(writes.len());
        for write in writes {
            let bytes = match &write {
                StagedWrite::Put(key, value) => match serde_json::to_vec(value) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        let outcome = TransactionOutcome::Failed(BackendError::new(
                            BackendErrorKind::Data,
                            format!("Failed to serialize entry for key '{key}': {e}"),
                        ));
                        self.core.finish(outcome.clone());
                        return outcome;
                    },
                },
                StagedWrite::Clear => None,
            };
            encoded.push((write, bytes));
        }

        // The terminal event is recorded by the blocking task itself, so a
        // dropped commit future still settles `done()`.
        let db = self.db.clone();
        let collection = self.collection.clone();
        let core = self.core.clone();
        let applied = tokio::task::spawn_blocking(move || {
            let outcome = match Self::apply_sync(&db, &collection, encoded) {
                Ok(()) => TransactionOutcome::Complete,
                Err(err) => TransactionOutcome::Failed(err),
            };
            core.finish(outcome.clone());
            outcome
        })
        .await;

        match applied {
            Ok(outcome) => outcome,
            Err(e) => {
                let outcome = TransactionOutcome::Failed(join_error(&e));
                self.core.finish(outcome.clone());
                outcome
            },
        }
    }

    fn abort(&self) -> Result<(), BackendError> {
        self.core.abort()
    }

    async fn done(&self) -> TransactionOutcome {
        self.core.done().await
    }
}
