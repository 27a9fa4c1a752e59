//! Deadline-bounded execution of backend operations.
//!
//! Every backend call made by the store goes through [`resolve_within`]:
//! whichever comes first, the backend's own terminal event or the deadline,
//! decides the result, and the result is produced exactly once. When the
//! deadline wins and a transaction owns the work, the transaction is aborted
//! and its abort event awaited before the timeout is reported, so a late
//! completion cannot slip past it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{Transaction, TransactionMode};
use crate::error::{BackendError, Result, StoreError, classify};
use crate::metrics;

/// Kind of operation, used for deadlines, logs and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Open,
    GetMany,
    SetMany,
    Clear,
    Refresh,
    Reconcile,
}

impl OperationKind {
    /// Name reported in errors and metrics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::GetMany => "getMany",
            Self::SetMany => "setMany",
            Self::Clear => "clear",
            Self::Refresh => "refresh",
            Self::Reconcile => "reconcile",
        }
    }

    /// Transaction mode the operation needs.
    #[must_use]
    pub const fn mode(self) -> TransactionMode {
        match self {
            Self::GetMany | Self::Refresh => TransactionMode::ReadOnly,
            Self::Open | Self::SetMany | Self::Clear | Self::Reconcile => {
                TransactionMode::ReadWrite
            },
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolve `work` or time out after `deadline`.
///
/// On timeout the work future is dropped first. Without a transaction the
/// timeout is reported right away. With one, the transaction is aborted. An
/// abort is refused once the transaction is committing or finished; the
/// refusal is swallowed. Either way the terminal event is awaited (bounded
/// by another `deadline`) before reporting the timeout, so a commit that was
/// still in flight has settled by the time the caller sees the error.
///
/// # Errors
///
/// Returns the error of `work`, or [`StoreError::Timeout`].
pub async fn resolve_within<T, F>(
    kind: OperationKind,
    deadline: Duration,
    transaction: Option<&Arc<dyn Transaction>>,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if let Ok(result) = tokio::time::timeout(deadline, work).await {
        return result;
    }

    metrics::record_timeout(kind);
    let Some(transaction) = transaction else {
        debug!(
            operation = %kind,
            deadline_ms = deadline.as_millis() as u64,
            "Request timed out"
        );
        return Err(StoreError::timeout(kind.name()));
    };

    if let Err(err) = transaction.abort() {
        debug!(operation = %kind, error = %err, "Transaction timed out past its abort point");
    }

    match tokio::time::timeout(deadline, transaction.done()).await {
        Ok(outcome) => debug!(
            operation = %kind,
            deadline_ms = deadline.as_millis() as u64,
            ?outcome,
            "Transaction timed out"
        ),
        Err(_) => warn!(operation = %kind, "Timed out transaction never reported its end"),
    }

    Err(StoreError::timeout(kind.name()))
}

/// Run `body` inside `transaction`, commit, and resolve within `deadline`.
///
/// A failing body aborts the transaction. The result is only reported once
/// the transaction's terminal event is known, so a returned `Ok` means the
/// writes of `body` were committed.
///
/// # Errors
///
/// Returns the classified error of the body or the commit, or a timeout.
pub async fn execute<T, F, Fut>(
    transaction: Arc<dyn Transaction>,
    kind: OperationKind,
    deadline: Duration,
    body: F,
) -> Result<T>
where
    F: FnOnce(Arc<dyn Transaction>) -> Fut,
    Fut: Future<Output = std::result::Result<T, BackendError>>,
{
    let work = async {
        let value = match body(transaction.clone()).await {
            Ok(value) => value,
            Err(err) => {
                // Already-finished transactions refuse the abort; the body
                // error is what gets reported either way. Waiting for the
                // end is bounded by the enclosing deadline.
                let _ = transaction.abort();
                transaction.done().await;
                return Err(classify(kind.name(), err));
            },
        };

        transaction
            .commit()
            .await
            .into_result()
            .map_err(|err| classify(kind.name(), err))?;
        Ok(value)
    };

    resolve_within(kind, deadline, Some(&transaction), work).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::transaction::{StagedWrite, TransactionCore};
    use crate::backend::{
        Backend, Connection, FaultyBackend, MemoryBackend, TransactionOutcome, Value,
    };
    use crate::error::BackendErrorKind;
    use async_trait::async_trait;
    use futures::FutureExt;
    use serde_json::json;

    /// Transaction whose commit and abort settle `delay` after being
    /// requested, like an engine reporting its events asynchronously.
    struct DelayedEnd {
        core: Arc<TransactionCore>,
        delay: Duration,
    }

    impl DelayedEnd {
        fn new(delay: Duration) -> Arc<dyn Transaction> {
            Arc::new(Self {
                core: Arc::new(TransactionCore::new(TransactionMode::ReadWrite)),
                delay,
            })
        }
    }

    #[async_trait]
    impl Transaction for DelayedEnd {
        fn mode(&self) -> TransactionMode {
            self.core.mode()
        }

        async fn get(&self, key: &str) -> std::result::Result<Option<Value>, BackendError> {
            self.core.ensure_active()?;
            Ok(self.core.overlay_value(key, None))
        }

        async fn get_all(&self) -> std::result::Result<Vec<Value>, BackendError> {
            self.core.ensure_active()?;
            Ok(Vec::new())
        }

        async fn get_all_keys(&self) -> std::result::Result<Vec<String>, BackendError> {
            self.core.ensure_active()?;
            Ok(Vec::new())
        }

        async fn put(&self, key: &str, value: Value) -> std::result::Result<(), BackendError> {
            self.core.stage(StagedWrite::Put(key.to_string(), value))
        }

        async fn clear(&self) -> std::result::Result<(), BackendError> {
            self.core.stage(StagedWrite::Clear)
        }

        async fn commit(&self) -> TransactionOutcome {
            if let Err(outcome) = self.core.begin_commit() {
                return outcome;
            }
            let core = self.core.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                core.finish(TransactionOutcome::Complete);
            });
            self.core.done().await
        }

        fn abort(&self) -> std::result::Result<(), BackendError> {
            self.core.ensure_active()?;
            let core = self.core.clone();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = core.abort();
            });
            Ok(())
        }

        async fn done(&self) -> TransactionOutcome {
            self.core.done().await
        }
    }

    const DEADLINE: Duration = Duration::from_millis(500);

    async fn setup() -> (MemoryBackend, FaultyBackend, Arc<dyn Connection>) {
        let memory = MemoryBackend::new();
        let faulty = FaultyBackend::new(Arc::new(memory.clone()));
        let connection = faulty.open("database", "store").await.unwrap();
        (memory, faulty, connection)
    }

    #[tokio::test]
    async fn test_execute_commits() {
        let (memory, _, connection) = setup().await;
        let tx = connection
            .transaction("store", TransactionMode::ReadWrite)
            .unwrap();

        let result = execute(tx, OperationKind::SetMany, DEADLINE, |tx| async move {
            tx.put("a", json!(1)).await
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(
            memory.entries("database", "store").unwrap().get("a"),
            Some(&json!(1))
        );
    }

    #[tokio::test]
    async fn test_execute_body_error_aborts() {
        let (memory, faulty, connection) = setup().await;
        let tx = connection
            .transaction("store", TransactionMode::ReadWrite)
            .unwrap();

        let result = execute(tx.clone(), OperationKind::SetMany, DEADLINE, |tx| async move {
            tx.put("a", json!(1)).await?;
            faulty.fail_requests(BackendErrorKind::Quota, Some(1));
            tx.put("b", json!(2)).await
        })
        .await;

        assert!(matches!(
            result,
            Err(StoreError::Unknown {
                kind: BackendErrorKind::Quota,
                ..
            })
        ));
        assert_eq!(tx.done().await, TransactionOutcome::Aborted);
        assert!(memory.entries("database", "store").unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_request_times_out_and_aborts() {
        let (memory, faulty, connection) = setup().await;
        let tx = connection
            .transaction("store", TransactionMode::ReadWrite)
            .unwrap();
        faulty.hang_requests(None);

        let start = tokio::time::Instant::now();
        let result = execute(tx.clone(), OperationKind::SetMany, DEADLINE, |tx| async move {
            tx.put("a", json!(1)).await
        })
        .await;

        assert_eq!(result.unwrap_err(), StoreError::timeout("setMany"));
        assert!(start.elapsed() < DEADLINE + Duration::from_millis(10));
        assert_eq!(tx.done().await, TransactionOutcome::Aborted);
        assert!(memory.entries("database", "store").unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_transaction() {
        let start = tokio::time::Instant::now();
        let result: Result<()> =
            resolve_within(OperationKind::Open, DEADLINE, None, std::future::pending()).await;

        assert_eq!(result.unwrap_err(), StoreError::timeout("open"));
        assert!(start.elapsed() >= DEADLINE);
        assert!(start.elapsed() < DEADLINE + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_refused_after_finish_is_swallowed() {
        let (_, _, connection) = setup().await;
        let tx = connection
            .transaction("store", TransactionMode::ReadOnly)
            .unwrap();
        assert_eq!(tx.commit().await, TransactionOutcome::Complete);

        let result: Result<()> = resolve_within(
            OperationKind::GetMany,
            DEADLINE,
            Some(&tx),
            std::future::pending(),
        )
        .await;

        assert_eq!(result.unwrap_err(), StoreError::timeout("getMany"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_waits_for_commit_in_flight() {
        let commit_delay = Duration::from_millis(700);
        let tx = DelayedEnd::new(commit_delay);

        let start = tokio::time::Instant::now();
        let result = execute(tx.clone(), OperationKind::SetMany, DEADLINE, |tx| async move {
            tx.put("a", json!(1)).await
        })
        .await;

        assert_eq!(result.unwrap_err(), StoreError::timeout("setMany"));
        assert!(start.elapsed() >= commit_delay, "resolved at {:?}", start.elapsed());
        assert_eq!(tx.done().now_or_never(), Some(TransactionOutcome::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_gives_up_on_commit_that_never_ends() {
        let tx = DelayedEnd::new(Duration::from_secs(3600));

        let start = tokio::time::Instant::now();
        let result = execute(tx.clone(), OperationKind::SetMany, DEADLINE, |tx| async move {
            tx.put("a", json!(1)).await
        })
        .await;

        assert_eq!(result.unwrap_err(), StoreError::timeout("setMany"));
        assert_eq!(start.elapsed(), DEADLINE * 2);
        assert_eq!(tx.done().now_or_never(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_body_error_waits_for_abort_event() {
        let abort_delay = Duration::from_millis(100);
        let tx = DelayedEnd::new(abort_delay);

        let start = tokio::time::Instant::now();
        let result: Result<()> = execute(tx.clone(), OperationKind::SetMany, DEADLINE, |_| async {
            Err(BackendError::new(BackendErrorKind::Quota, "disk full"))
        })
        .await;

        assert!(matches!(
            result,
            Err(StoreError::Unknown {
                kind: BackendErrorKind::Quota,
                ..
            })
        ));
        assert!(start.elapsed() >= abort_delay);
        assert_eq!(tx.done().now_or_never(), Some(TransactionOutcome::Aborted));
    }

    #[test]
    fn test_operation_kind_modes() {
        assert_eq!(OperationKind::GetMany.mode(), TransactionMode::ReadOnly);
        assert_eq!(OperationKind::Clear.mode(), TransactionMode::ReadWrite);
        assert_eq!(OperationKind::SetMany.to_string(), "setMany");
    }
}
