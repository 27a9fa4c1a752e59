//! Storage backend contract with pluggable implementations.
//!
//! The store talks to an asynchronous, transactional engine through three
//! traits that mirror how browser-style storage engines behave:
//!
//! - [`Backend`] opens a database (provisioning the collection on first use)
//!   and exposes a cheap introspection call used as a liveness probe.
//! - [`Connection`] starts grouped operations and can be closed by the
//!   backend at any time.
//! - [`Transaction`] carries single requests (`get`, `put`, ...) and
//!   resolves once with complete, abort or error.
//!
//! Implementations:
//!
//! - **MemoryBackend**: in-process engine (testing/embedding)
//! - **RedbBackend**: persistent engine with ACID guarantees (default for CLI)
//! - **FaultyBackend**: wrapper injecting failures and hangs (testing)
//!
//! # Custom Backends
//!
//! ```ignore
//! use steadykv::backend::{Backend, Connection};
//!
//! struct IndexedDbBackend { /* ... */ }
//!
//! #[async_trait::async_trait]
//! impl Backend for IndexedDbBackend { /* ... */ }
//! ```

mod faulty;
mod memory;
#[cfg(feature = "redb")]
mod redb;
pub(crate) mod transaction;
mod types;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::BackendError;

pub use faulty::{Fault, FaultyBackend};
pub use memory::MemoryBackend;
#[cfg(feature = "redb")]
pub use redb::RedbBackend;
pub use types::{TransactionMode, TransactionOutcome, Value};

/// Entry point of a storage engine.
///
/// All backends must be thread-safe (`Send + Sync`) for use with tokio.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Opens `database`, creating `collection` if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Fails with kind `Blocked` when another holder prevents the open and
    /// with kind `Constraint` when the collection cannot be provisioned.
    async fn open(&self, database: &str, collection: &str)
    -> Result<Arc<dyn Connection>, BackendError>;

    /// Lists known databases.
    ///
    /// Only used as a lightweight liveness probe; it must not depend on any
    /// particular collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be introspected.
    async fn list_databases(&self) -> Result<Vec<String>, BackendError>;
}

/// Session handle to one database.
pub trait Connection: Send + Sync {
    /// Starts a grouped operation on `collection`.
    ///
    /// # Errors
    ///
    /// Fails with kind `Closed` once the connection has been closed and with
    /// kind `NotFound` if the collection does not exist.
    fn transaction(
        &self,
        collection: &str,
        mode: TransactionMode,
    ) -> Result<Arc<dyn Transaction>, BackendError>;

    /// Closes the connection. Later transactions fail with kind `Closed`.
    fn close(&self);

    /// Returns true once the connection has been closed.
    fn is_closed(&self) -> bool;
}

/// A grouped operation, committed or aborted as a unit.
///
/// Writes are staged until [`Transaction::commit`] and are visible to later
/// reads of the same transaction. All reads of a transaction see the
/// committed state as of its first read; commits made by others afterwards
/// are not visible. Key order is ascending for both [`Transaction::get_all`]
/// and [`Transaction::get_all_keys`], so the two can be zipped.
///
/// The terminal event must be recorded even if the future returned by
/// [`Transaction::commit`] is dropped while the commit is in progress.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Mode the transaction was started with.
    fn mode(&self) -> TransactionMode;

    /// Reads one key.
    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError>;

    /// Reads every value, in key order.
    async fn get_all(&self) -> Result<Vec<Value>, BackendError>;

    /// Reads every key, in key order.
    async fn get_all_keys(&self) -> Result<Vec<String>, BackendError>;

    /// Stages a write.
    async fn put(&self, key: &str, value: Value) -> Result<(), BackendError>;

    /// Stages the removal of every entry.
    async fn clear(&self) -> Result<(), BackendError>;

    /// Ends the transaction and resolves with its terminal event.
    async fn commit(&self) -> TransactionOutcome;

    /// Aborts the transaction.
    ///
    /// # Errors
    ///
    /// Fails with kind `InvalidState` if the transaction already finished or
    /// is committing.
    fn abort(&self) -> Result<(), BackendError>;

    /// Waits for the terminal event (complete, abort or error).
    async fn done(&self) -> TransactionOutcome;
}
