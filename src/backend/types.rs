//! Types shared by backend implementations.

use crate::error::{BackendError, BackendErrorKind};

/// Stored value type.
pub type Value = serde_json::Value;

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Terminal event of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Complete,
    Aborted,
    Failed(BackendError),
}

impl TransactionOutcome {
    /// Turn the terminal event into a result.
    ///
    /// # Errors
    ///
    /// An aborted transaction becomes a `Abort` backend error, a failed one
    /// returns its own error.
    pub fn into_result(self) -> Result<(), BackendError> {
        match self {
            Self::Complete => Ok(()),
            Self::Aborted => Err(BackendError::new(
                BackendErrorKind::Abort,
                "The transaction was aborted",
            )),
            Self::Failed(err) => Err(err),
        }
    }
}
