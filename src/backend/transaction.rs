//! Transaction lifecycle shared by the bundled backends.
//!
//! Tracks the active -> committing -> finished phases, stages writes until
//! commit and lets any number of waiters observe the terminal event.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::watch;

use super::types::{TransactionMode, TransactionOutcome, Value};
use crate::error::BackendError;

/// Write recorded by a read-write transaction, applied on commit.
#[derive(Debug, Clone)]
pub(crate) enum StagedWrite {
    Put(String, Value),
    Clear,
}

impl StagedWrite {
    /// Apply the write to a materialized collection.
    pub(crate) fn apply(self, entries: &mut BTreeMap<String, Value>) {
        match self {
            Self::Put(key, value) => {
                entries.insert(key, value);
            },
            Self::Clear => entries.clear(),
        }
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Active,
    Committing,
    Finished(TransactionOutcome),
}

fn outcome(phase: &Phase) -> Option<TransactionOutcome> {
    match phase {
        Phase::Finished(outcome) => Some(outcome.clone()),
        Phase::Active | Phase::Committing => None,
    }
}

pub(crate) struct TransactionCore {
    mode: TransactionMode,
    staged: Mutex<Vec<StagedWrite>>,
    phase: watch::Sender<Phase>,
}

impl TransactionCore {
    pub(crate) fn new(mode: TransactionMode) -> Self {
        let (phase, _) = watch::channel(Phase::Active);
        Self {
            mode,
            staged: Mutex::new(Vec::new()),
            phase,
        }
    }

    pub(crate) fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Fails once the transaction left the active phase.
    pub(crate) fn ensure_active(&self) -> Result<(), BackendError> {
        match *self.phase.borrow() {
            Phase::Active => Ok(()),
            Phase::Committing | Phase::Finished(_) => Err(BackendError::inactive()),
        }
    }

    pub(crate) fn stage(&self, write: StagedWrite) -> Result<(), BackendError> {
        self.ensure_active()?;
        if self.mode == TransactionMode::ReadOnly {
            return Err(BackendError::read_only());
        }
        self.staged.lock().push(write);
        Ok(())
    }

    /// Value of `key` as seen by this transaction.
    pub(crate) fn overlay_value(&self, key: &str, committed: Option<Value>) -> Option<Value> {
        self.staged
            .lock()
            .iter()
            .fold(committed, |current, write| match write {
                StagedWrite::Put(staged_key, value) if staged_key == key => Some(value.clone()),
                StagedWrite::Put(..) => current,
                StagedWrite::Clear => None,
            })
    }

    /// Whole collection as seen by this transaction.
    pub(crate) fn overlay_all(
        &self,
        mut committed: BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        for write in self.staged.lock().iter().cloned() {
            write.apply(&mut committed);
        }
        committed
    }

    /// Move to the committing phase and hand out the staged writes.
    ///
    /// Returns the terminal event instead if the transaction already ended.
    pub(crate) fn begin_commit(&self) -> Result<Vec<StagedWrite>, TransactionOutcome> {
        let mut started = false;
        self.phase.send_if_modified(|phase| {
            if matches!(phase, Phase::Active) {
                *phase = Phase::Committing;
                started = true;
                true
            } else {
                false
            }
        });

        if started {
            Ok(std::mem::take(&mut *self.staged.lock()))
        } else {
            Err(outcome(&self.phase.borrow())
                .unwrap_or_else(|| TransactionOutcome::Failed(BackendError::inactive())))
        }
    }

    /// Record the terminal event. Only the first call has an effect.
    pub(crate) fn finish(&self, result: TransactionOutcome) {
        self.phase.send_if_modified(|phase| {
            if outcome(phase).is_some() {
                false
            } else {
                *phase = Phase::Finished(result);
                true
            }
        });
    }

    pub(crate) fn abort(&self) -> Result<(), BackendError> {
        let mut aborted = false;
        self.phase.send_if_modified(|phase| {
            if matches!(phase, Phase::Active) {
                *phase = Phase::Finished(TransactionOutcome::Aborted);
                aborted = true;
                true
            } else {
                false
            }
        });

        if aborted {
            self.staged.lock().clear();
            Ok(())
        } else {
            Err(BackendError::inactive())
        }
    }

    pub(crate) async fn done(&self) -> TransactionOutcome {
        let mut rx = self.phase.subscribe();
        let finished = rx
            .wait_for(|phase| outcome(phase).is_some())
            .await
            .ok()
            .and_then(|phase| outcome(&phase));
        finished.unwrap_or(TransactionOutcome::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_staged_writes_are_visible() {
        let core = TransactionCore::new(TransactionMode::ReadWrite);
        core.stage(StagedWrite::Put("a".into(), json!(1))).unwrap();
        assert_eq!(core.overlay_value("a", None), Some(json!(1)));
        assert_eq!(core.overlay_value("b", Some(json!(2))), Some(json!(2)));

        core.stage(StagedWrite::Clear).unwrap();
        assert_eq!(core.overlay_value("b", Some(json!(2))), None);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let core = TransactionCore::new(TransactionMode::ReadOnly);
        let err = core.stage(StagedWrite::Clear).unwrap_err();
        assert_eq!(err, BackendError::read_only());
    }

    #[test]
    fn test_abort_after_commit_fails() {
        let core = TransactionCore::new(TransactionMode::ReadWrite);
        let writes = core.begin_commit().unwrap();
        assert!(writes.is_empty());
        core.finish(TransactionOutcome::Complete);
        assert!(core.abort().is_err());
    }

    #[test]
    fn test_commit_after_abort_reports_abort() {
        let core = TransactionCore::new(TransactionMode::ReadWrite);
        core.abort().unwrap();
        assert_eq!(core.begin_commit().unwrap_err(), TransactionOutcome::Aborted);
        assert!(core.ensure_active().is_err());
    }

    #[tokio::test]
    async fn test_done_resolves_after_finish() {
        let core = std::sync::Arc::new(TransactionCore::new(TransactionMode::ReadOnly));
        let waiter = {
            let core = core.clone();
            tokio::spawn(async move { core.done().await })
        };
        core.begin_commit().unwrap();
        core.finish(TransactionOutcome::Complete);
        assert_eq!(waiter.await.unwrap(), TransactionOutcome::Complete);
    }
}
