//! Backend session: lazy, coalesced open and transparent reopen.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backend::{Backend, Connection, Transaction};
use crate::error::{BackendError, BackendErrorKind, Result, StoreError, classify};
use crate::metrics;
use crate::reliability::{LivenessProbe, OperationKind, resolve_within};

/// Connection plus the transaction started on it.
pub(crate) struct Lease {
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) transaction: Arc<dyn Transaction>,
}

/// Owns the single connection of a store.
///
/// The connection slot is an async mutex held across the open, so
/// concurrent callers wait for one in-flight open instead of starting
/// their own.
pub(crate) struct Session {
    backend: Arc<dyn Backend>,
    database: String,
    collection: String,
    probe: Arc<dyn LivenessProbe>,
    open_timeout: Duration,
    connection: Mutex<Option<Arc<dyn Connection>>>,
}

impl Session {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        database: &str,
        collection: &str,
        probe: Arc<dyn LivenessProbe>,
        open_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            database: database.to_string(),
            collection: collection.to_string(),
            probe,
            open_timeout,
            connection: Mutex::new(None),
        }
    }

    /// Current connection, opened on first use or after it was closed.
    pub(crate) async fn connection(&self) -> Result<Arc<dyn Connection>> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref()
            && !connection.is_closed()
        {
            return Ok(connection.clone());
        }

        if slot.take().is_some() {
            metrics::record_reopen();
            info!(
                database = %self.database,
                collection = %self.collection,
                "Backend closed the connection, reopening"
            );
        }

        let connection = self.open().await?;
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn open(&self) -> Result<Arc<dyn Connection>> {
        self.probe.check(self.backend.as_ref()).await?;

        let open = async {
            self.backend
                .open(&self.database, &self.collection)
                .await
                .map_err(|err| self.classify_open(err))
        };
        let connection = resolve_within(OperationKind::Open, self.open_timeout, None, open).await?;

        debug!(
            database = %self.database,
            collection = %self.collection,
            "Backend connection opened"
        );
        Ok(connection)
    }

    fn classify_open(&self, err: BackendError) -> StoreError {
        if err.kind == BackendErrorKind::Constraint {
            return StoreError::provisioning_failed(&self.collection, err.message);
        }
        classify(OperationKind::Open.name(), err)
    }

    /// Starts a transaction, reopening once if the connection was closed.
    pub(crate) async fn begin(&self, kind: OperationKind) -> Result<Lease> {
        let connection = self.connection().await?;
        match connection.transaction(&self.collection, kind.mode()) {
            Ok(transaction) => Ok(Lease {
                connection,
                transaction,
            }),
            Err(err) if err.is_connection_closed() => {
                debug!(operation = %kind, error = %err, "Connection closed, reopening");
                self.invalidate(&connection).await;
                let connection = self.connection().await?;
                let transaction = connection
                    .transaction(&self.collection, kind.mode())
                    .map_err(|err| classify(kind.name(), err))?;
                Ok(Lease {
                    connection,
                    transaction,
                })
            },
            Err(err) => Err(classify(kind.name(), err)),
        }
    }

    /// Forgets `stale` so that the next call reopens.
    ///
    /// A connection that already replaced `stale` is left alone.
    pub(crate) async fn invalidate(&self, stale: &Arc<dyn Connection>) {
        let mut slot = self.connection.lock().await;
        if slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, stale))
        {
            stale.close();
            *slot = None;
            metrics::record_reopen();
        }
    }

    /// Closes the connection, if any. The next call opens a new one.
    pub(crate) async fn close(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close();
        }
    }
}
