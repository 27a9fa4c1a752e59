//! Public store API over the session, the cache and the mode machine.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use super::cache::{CacheRegistry, FallbackCache};
use super::markers::{MarkerRegistry, MemoryMarkers};
use super::mode::{ModeState, StoreMode};
use super::session::Session;
use crate::backend::{Backend, Transaction, Value};
use crate::config::StoreConfig;
use crate::error::{BackendError, Result, StoreError};
use crate::metrics;
use crate::reliability::{LivenessProbe, OperationKind, RetryConfig, execute, retry_with_hook};

/// Observability side-channel, called once per failure that exhausted its
/// retry budget.
pub type ErrorHook = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// Builder for [`Store`].
///
/// # Example
///
/// ```ignore
/// let store = Store::builder(Arc::new(MemoryBackend::new()), "app", "prefs")
///     .config(StoreConfig::default().with_transaction_retries(3))
///     .on_error(|err| tracing::error!(error = %err, "store failure"))
///     .open()
///     .await;
/// ```
pub struct StoreBuilder {
    backend: Arc<dyn Backend>,
    database: String,
    collection: String,
    config: StoreConfig,
    markers: Option<Arc<dyn MarkerRegistry>>,
    registry: Option<Arc<CacheRegistry>>,
    probe: Option<Arc<dyn LivenessProbe>>,
    on_error: Option<ErrorHook>,
}

impl StoreBuilder {
    #[must_use]
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable marker registry. Defaults to [`MemoryMarkers::global`].
    #[must_use]
    pub fn markers(mut self, markers: Arc<dyn MarkerRegistry>) -> Self {
        self.markers = Some(markers);
        self
    }

    /// Cache registry. Defaults to [`CacheRegistry::global`].
    #[must_use]
    pub fn registry(mut self, registry: Arc<CacheRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Liveness probe, overriding the one selected by the config.
    #[must_use]
    pub fn probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&StoreError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Opens the backend, reconciles if needed and returns the store.
    ///
    /// Never fails: a store whose backend could not be opened or reconciled
    /// starts in [`StoreMode::Degraded`] and the failure goes to `on_error`.
    pub async fn open(self) -> Store {
        let markers = self
            .markers
            .unwrap_or_else(|| MemoryMarkers::global() as Arc<dyn MarkerRegistry>);
        let registry = self.registry.unwrap_or_else(CacheRegistry::global);
        let probe = self.probe.unwrap_or_else(|| self.config.probe());

        let inner = StoreInner {
            session: Session::new(
                self.backend,
                &self.database,
                &self.collection,
                probe,
                self.config.open_timeout(),
            ),
            cache: registry.get_or_create(&self.database, &self.collection),
            mode: ModeState::new(&self.database, &self.collection, markers),
            retry: self.config.retry_config(),
            config: self.config,
            on_error: self.on_error,
            database: self.database,
            collection: self.collection,
        };
        inner.initialize().await;

        Store {
            inner: Arc::new(inner),
        }
    }
}

/// Resilient key-value store for one (database, collection) pair.
///
/// Every backend call is deadline-bounded and retried. Once the backend has
/// failed past its retry budget the store degrades: from then on the
/// fallback cache answers every call, and the next store built for the same
/// pair clears the backend before using it again.
///
/// `Store` is `Clone`; clones share the connection, the cache and the mode.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("database", &self.inner.database)
            .field("collection", &self.inner.collection)
            .field("mode", &self.inner.mode.current())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Starts building a store over `backend`.
    pub fn builder(
        backend: Arc<dyn Backend>,
        database: impl Into<String>,
        collection: impl Into<String>,
    ) -> StoreBuilder {
        StoreBuilder {
            backend,
            database: database.into(),
            collection: collection.into(),
            config: StoreConfig::default(),
            markers: None,
            registry: None,
            probe: None,
            on_error: None,
        }
    }

    /// Reads `keys`. Every requested key is present in the result, mapped
    /// to `None` when it has no value.
    ///
    /// # Errors
    ///
    /// Returns the backend failure when the in-memory fallback is disabled,
    /// or when the failure is `Blocked`.
    pub async fn get_many<I, K>(&self, keys: I) -> Result<HashMap<String, Option<Value>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.inner.get_many(keys).await
    }

    /// Writes `entries` as one atomic backend transaction.
    ///
    /// The cache is updated before the backend is written.
    ///
    /// # Errors
    ///
    /// Returns the backend failure when the in-memory fallback is disabled,
    /// or when the failure is `Blocked`.
    pub async fn set_many<I, K>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let entries: Vec<(String, Value)> = entries
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect();
        self.inner.set_many(entries).await
    }

    /// Removes every entry.
    ///
    /// The cache is only cleared once the backend confirmed the clear.
    ///
    /// # Errors
    ///
    /// Returns the backend failure. The cache is left untouched.
    pub async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    /// Re-reads the whole collection and makes the cache mirror it.
    ///
    /// Meant for when the embedding application regains focus. A degraded
    /// store keeps its cache as is.
    ///
    /// # Errors
    ///
    /// Returns the backend failure when the in-memory fallback is disabled.
    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }

    pub fn mode(&self) -> StoreMode {
        self.inner.mode.current()
    }

    /// Closes the backend connection. A later call reopens it.
    pub async fn close(&self) {
        self.inner.session.close().await;
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Sorted copy of the fallback cache.
    pub fn cached_entries(&self) -> BTreeMap<String, Value> {
        self.inner.cache.snapshot()
    }
}

struct StoreInner {
    database: String,
    collection: String,
    config: StoreConfig,
    retry: RetryConfig,
    session: Session,
    cache: Arc<FallbackCache>,
    mode: ModeState,
    on_error: Option<ErrorHook>,
}

impl StoreInner {
    async fn initialize(&self) {
        let connected = retry_with_hook(
            &self.retry,
            || self.session.connection(),
            StoreError::is_retryable,
            |err, attempt| self.on_failed_attempt(OperationKind::Open, err, attempt),
        )
        .await;

        if let Err(err) = connected {
            self.fail(OperationKind::Open, &err);
            return;
        }

        if self.mode.needs_reconciliation() {
            info!(
                database = %self.database,
                collection = %self.collection,
                "Store was degraded in a previous session, clearing backend"
            );
            let clear = |tx: Arc<dyn Transaction>| async move { tx.clear().await };
            match self.attempt(OperationKind::Reconcile, &clear).await {
                Ok(()) => {
                    self.mode.reconciled();
                    self.cache.clear();
                    metrics::record_operation(OperationKind::Reconcile, "ok");
                },
                Err(err) => {
                    metrics::record_operation(OperationKind::Reconcile, err.label());
                    self.fail(OperationKind::Reconcile, &err);
                    return;
                },
            }
        }

        self.mode.go_live();
    }

    async fn get_many(&self, keys: Vec<String>) -> Result<HashMap<String, Option<Value>>> {
        if self.mode.is_degraded() {
            metrics::record_operation(OperationKind::GetMany, "cache");
            return Ok(self.cache.get_many(&keys));
        }

        let requested = &keys;
        let result = self
            .run(OperationKind::GetMany, move |tx| async move {
                let mut values = Vec::with_capacity(requested.len());
                for key in requested {
                    values.push(tx.get(key).await?);
                }
                Ok::<_, BackendError>(values)
            })
            .await;

        match result {
            Ok(values) => {
                let fetched: HashMap<String, Option<Value>> =
                    keys.into_iter().zip(values).collect();
                self.cache.apply_fetched(&fetched);
                Ok(fetched)
            },
            Err(err) => {
                self.fail(OperationKind::GetMany, &err);
                self.fallback(err, || self.cache.get_many(&keys))
            },
        }
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        self.cache.insert_many(entries.iter().cloned());

        if self.mode.is_degraded() {
            metrics::record_operation(OperationKind::SetMany, "cache");
            return Ok(());
        }

        let written = &entries;
        let result = self
            .run(OperationKind::SetMany, move |tx| async move {
                for (key, value) in written {
                    tx.put(key, value.clone()).await?;
                }
                Ok::<_, BackendError>(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail(OperationKind::SetMany, &err);
                self.fallback(err, || ())
            },
        }
    }

    async fn clear(&self) -> Result<()> {
        if self.mode.is_degraded() {
            self.cache.clear();
            metrics::record_operation(OperationKind::Clear, "cache");
            return Ok(());
        }

        let result = self
            .run(OperationKind::Clear, |tx| async move { tx.clear().await })
            .await;

        match result {
            Ok(()) => {
                self.cache.clear();
                Ok(())
            },
            Err(err) => {
                self.fail(OperationKind::Clear, &err);
                Err(err)
            },
        }
    }

    async fn refresh(&self) -> Result<()> {
        if self.mode.is_degraded() {
            return Ok(());
        }

        let result = self
            .run(OperationKind::Refresh, |tx| async move {
                let keys = tx.get_all_keys().await?;
                let values = tx.get_all().await?;
                Ok::<_, BackendError>(keys.into_iter().zip(values).collect::<Vec<_>>())
            })
            .await;

        match result {
            Ok(remote) => {
                debug!(entries = remote.len(), "Cache refreshed from backend");
                self.cache.replace_all(remote);
                Ok(())
            },
            Err(err) => {
                self.fail(OperationKind::Refresh, &err);
                self.fallback(err, || ())
            },
        }
    }

    /// One attempt: begin a transaction, run `body` in it, commit.
    async fn attempt<T, F, Fut>(&self, kind: OperationKind, body: &F) -> Result<T>
    where
        F: Fn(Arc<dyn Transaction>) -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let lease = self.session.begin(kind).await?;
        let result = execute(
            lease.transaction,
            kind,
            self.config.transaction_timeout(),
            body,
        )
        .await;

        if let Err(err) = &result
            && err.is_connection_closed()
        {
            self.session.invalidate(&lease.connection).await;
        }
        result
    }

    /// Retried [`StoreInner::attempt`].
    async fn run<T, F, Fut>(&self, kind: OperationKind, body: F) -> Result<T>
    where
        F: Fn(Arc<dyn Transaction>) -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let body = &body;
        let result = retry_with_hook(
            &self.retry,
            move || self.attempt(kind, body),
            StoreError::is_retryable,
            |err, attempt| self.on_failed_attempt(kind, err, attempt),
        )
        .await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.label(),
        };
        metrics::record_operation(kind, outcome);
        result
    }

    fn on_failed_attempt(
        &self,
        kind: OperationKind,
        err: &StoreError,
        attempt: u32,
    ) -> std::future::Ready<()> {
        metrics::record_retry(kind, err);
        debug!(
            database = %self.database,
            collection = %self.collection,
            operation = %kind,
            attempt = attempt,
            error = %err,
            "Backend attempt failed"
        );
        std::future::ready(())
    }

    /// Degrades the store and reports `err`.
    fn fail(&self, kind: OperationKind, err: &StoreError) {
        self.mode.degrade(&format!("{kind} failed: {err}"));
        if let Some(hook) = &self.on_error {
            hook(err);
        }
    }

    /// Answers from the cache when allowed, else surfaces `err`.
    fn fallback<T>(&self, err: StoreError, from_cache: impl FnOnce() -> T) -> Result<T> {
        if self.config.enable_in_memory_fallback && err.is_retryable() {
            Ok(from_cache())
        } else {
            Err(err)
        }
    }
}
