//! Fault-injecting backend wrapper.
//!
//! Wraps any [`Backend`] and makes opens, requests or probe calls fail or
//! hang on demand. Each kind of call counts how often it was made so tests
//! can assert on the exact traffic that reached the backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::types::{TransactionMode, TransactionOutcome, Value};
use super::{Backend, Connection, Transaction};
use crate::error::{BackendError, BackendErrorKind};

/// Misbehaviour injected into a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with an error of the given kind.
    Fail(BackendErrorKind),
    /// Never complete.
    Hang,
}

impl Fault {
    async fn inject(self, call: &str) -> Result<(), BackendError> {
        match self {
            Self::Fail(kind) => Err(BackendError::new(
                kind,
                format!("Injected failure in {call}"),
            )),
            Self::Hang => std::future::pending().await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    fault: Fault,
    /// Calls still affected; `None` means every call.
    remaining: Option<u32>,
}

#[derive(Default)]
struct Schedule(Mutex<Option<Rule>>);

impl Schedule {
    fn set(&self, fault: Fault, times: Option<u32>) {
        *self.0.lock() = match times {
            Some(0) => None,
            remaining => Some(Rule { fault, remaining }),
        };
    }

    fn clear(&self) {
        *self.0.lock() = None;
    }

    /// Fault to inject into the next call, consuming one use of the rule.
    fn next(&self) -> Option<Fault> {
        let mut rule = self.0.lock();
        let current = (*rule)?;
        match current.remaining {
            None => {},
            Some(1) => *rule = None,
            Some(n) => {
                *rule = Some(Rule {
                    remaining: Some(n - 1),
                    ..current
                });
            },
        }
        Some(current.fault)
    }
}

#[derive(Default)]
struct FaultState {
    opens: Schedule,
    requests: Schedule,
    probes: Schedule,
    open_calls: AtomicU32,
    probe_calls: AtomicU32,
    transaction_calls: AtomicU32,
    clear_calls: AtomicU32,
    commit_calls: AtomicU32,
}

impl FaultState {
    async fn request(&self, call: &str) -> Result<(), BackendError> {
        match self.requests.next() {
            Some(fault) => fault.inject(call).await,
            None => Ok(()),
        }
    }
}

/// Backend wrapper that injects faults.
///
/// # Example
///
/// ```ignore
/// use steadykv::backend::{FaultyBackend, MemoryBackend};
///
/// let backend = FaultyBackend::new(Arc::new(MemoryBackend::new()));
/// backend.hang_requests(None);
/// // every get/put/clear/commit now hangs until `heal()`
/// ```
#[derive(Clone)]
pub struct FaultyBackend {
    inner: Arc<dyn Backend>,
    state: Arc<FaultState>,
}

impl FaultyBackend {
    /// Wraps `inner`, initially healthy.
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            state: Arc::new(FaultState::default()),
        }
    }

    /// Makes the next `times` opens (all if `None`) fail with `kind`.
    pub fn fail_opens(&self, kind: BackendErrorKind, times: Option<u32>) {
        self.state.opens.set(Fault::Fail(kind), times);
    }

    /// Makes the next `times` opens (all if `None`) hang.
    pub fn hang_opens(&self, times: Option<u32>) {
        self.state.opens.set(Fault::Hang, times);
    }

    /// Makes the next `times` requests (all if `None`) fail with `kind`.
    ///
    /// Requests are `get`, `get_all`, `get_all_keys`, `put`, `clear` and
    /// `commit`.
    pub fn fail_requests(&self, kind: BackendErrorKind, times: Option<u32>) {
        self.state.requests.set(Fault::Fail(kind), times);
    }

    /// Makes the next `times` requests (all if `None`) hang.
    pub fn hang_requests(&self, times: Option<u32>) {
        self.state.requests.set(Fault::Hang, times);
    }

    /// Makes the next `times` probe calls (all if `None`) fail with `kind`.
    pub fn fail_probe(&self, kind: BackendErrorKind, times: Option<u32>) {
        self.state.probes.set(Fault::Fail(kind), times);
    }

    /// Makes the next `times` probe calls (all if `None`) hang.
    pub fn hang_probe(&self, times: Option<u32>) {
        self.state.probes.set(Fault::Hang, times);
    }

    /// Removes every injected fault.
    pub fn heal(&self) {
        self.state.opens.clear();
        self.state.requests.clear();
        self.state.probes.clear();
    }

    /// Number of `open` calls made.
    pub fn open_calls(&self) -> u32 {
        self.state.open_calls.load(Ordering::SeqCst)
    }

    /// Number of `list_databases` calls made.
    pub fn probe_calls(&self) -> u32 {
        self.state.probe_calls.load(Ordering::SeqCst)
    }

    /// Number of transactions started.
    pub fn transaction_calls(&self) -> u32 {
        self.state.transaction_calls.load(Ordering::SeqCst)
    }

    /// Number of `clear` requests made.
    pub fn clear_calls(&self) -> u32 {
        self.state.clear_calls.load(Ordering::SeqCst)
    }

    /// Number of `commit` calls made.
    pub fn commit_calls(&self) -> u32 {
        self.state.commit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for FaultyBackend {
    async fn open(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<Arc<dyn Connection>, BackendError> {
        self.state.open_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.state.opens.next() {
            fault.inject("open").await?;
        }

        let inner = self.inner.open(database, collection).await?;
        Ok(Arc::new(FaultyConnection {
            inner,
            state: self.state.clone(),
        }))
    }

    async fn list_databases(&self) -> Result<Vec<String>, BackendError> {
        self.state.probe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fault) = self.state.probes.next() {
            fault.inject("list_databases").await?;
        }
        self.inner.list_databases().await
    }
}

struct FaultyConnection {
    inner: Arc<dyn Connection>,
    state: Arc<FaultState>,
}

impl Connection for FaultyConnection {
    fn transaction(
        &self,
        collection: &str,
        mode: TransactionMode,
    ) -> Result<Arc<dyn Transaction>, BackendError> {
        self.state.transaction_calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.transaction(collection, mode)?;
        Ok(Arc::new(FaultyTransaction {
            inner,
            state: self.state.clone(),
        }))
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

struct FaultyTransaction {
    inner: Arc<dyn Transaction>,
    state: Arc<FaultState>,
}

#[async_trait]
impl Transaction for FaultyTransaction {
    fn mode(&self) -> TransactionMode {
        self.inner.mode()
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, BackendError> {
        self.state.request("get").await?;
        self.inner.get(key).await
    }

    async fn get_all(&self) -> Result<Vec<Value>, BackendError> {
        self.state.request("get_all").await?;
        self.inner.get_all().await
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, BackendError> {
        self.state.request("get_all_keys").await?;
        self.inner.get_all_keys().await
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), BackendError> {
        self.state.request("put").await?;
        self.inner.put(key, value).await
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.state.clear_calls.fetch_add(1, Ordering::SeqCst);
        self.state.request("clear").await?;
        self.inner.clear().await
    }

    async fn commit(&self) -> TransactionOutcome {
        self.state.commit_calls.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.state.request("commit").await {
            // The engine rolls back a transaction whose commit failed.
            let _ = self.inner.abort();
            return TransactionOutcome::Failed(err);
        }
        self.inner.commit().await
    }

    fn abort(&self) -> Result<(), BackendError> {
        self.inner.abort()
    }

    async fn done(&self) -> TransactionOutcome {
        self.inner.done().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;
    use std::time::Duration;

    fn faulty() -> FaultyBackend {
        FaultyBackend::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_healthy_by_default() {
        let backend = faulty();
        let connection = backend.open("database", "store").await.unwrap();
        let tx = connection
            .transaction("store", TransactionMode::ReadWrite)
            .unwrap();
        tx.put("a", json!(1)).await.unwrap();
        assert_eq!(tx.commit().await, TransactionOutcome::Complete);

        assert_eq!(backend.open_calls(), 1);
        assert_eq!(backend.transaction_calls(), 1);
        assert_eq!(backend.commit_calls(), 1);
    }

    #[tokio::test]
    async fn test_fail_counted_times() {
        let backend = faulty();
        backend.fail_opens(BackendErrorKind::Unknown, Some(2));

        assert!(backend.open("database", "store").await.is_err());
        assert!(backend.open("database", "store").await.is_err());
        assert!(backend.open("database", "store").await.is_ok());
        assert_eq!(backend.open_calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back() {
        let memory = MemoryBackend::new();
        let backend = FaultyBackend::new(Arc::new(memory.clone()));
        let connection = backend.open("database", "store").await.unwrap();

        let tx = connection
            .transaction("store", TransactionMode::ReadWrite)
            .unwrap();
        tx.put("a", json!(1)).await.unwrap();
        backend.fail_requests(BackendErrorKind::Quota, None);

        let outcome = tx.commit().await;
        assert!(matches!(outcome, TransactionOutcome::Failed(ref e) if e.kind == BackendErrorKind::Quota));
        assert!(memory.entries("database", "store").unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_until_healed() {
        let backend = faulty();
        backend.hang_probe(None);

        let hung = tokio::time::timeout(Duration::from_secs(5), backend.list_databases()).await;
        assert!(hung.is_err());

        backend.heal();
        assert!(backend.list_databases().await.is_ok());
        assert_eq!(backend.probe_calls(), 2);
    }
}
