//! Error types for typed error handling.
//!
//! Backends report [`BackendError`]s, a kind plus a message in the spirit of
//! the exceptions a browser storage engine raises. The store never hands those
//! to callers directly: every failure is classified into a [`StoreError`] that
//! drives the recovery policy (reopen, retry, degrade).

use std::fmt;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Messages that a backend uses when the connection went away under us.
const CLOSED_CONNECTION_MESSAGES: [&str; 2] = [
    "The database connection is closing",
    "Can't start a transaction on a closed database",
];

/// Category of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    Unknown,
    InvalidState,
    Timeout,
    Abort,
    /// Another holder of the database prevents the operation.
    Blocked,
    /// Provisioning a collection failed.
    Constraint,
    Quota,
    /// The connection was closed by the backend.
    Closed,
    NotFound,
    Data,
    /// A write was attempted on a read-only transaction.
    ReadOnly,
}

impl BackendErrorKind {
    /// Stable name used in messages and metrics labels.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UnknownError",
            Self::InvalidState => "InvalidStateError",
            Self::Timeout => "TimeoutError",
            Self::Abort => "AbortError",
            Self::Blocked => "BlockedError",
            Self::Constraint => "ConstraintError",
            Self::Quota => "QuotaExceededError",
            Self::Closed => "ClosedError",
            Self::NotFound => "NotFoundError",
            Self::Data => "DataError",
            Self::ReadOnly => "ReadOnlyError",
        }
    }
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure reported by a backend request, transaction or open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    /// Create a backend error.
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error returned when a transaction is started on a closed connection.
    pub fn closed() -> Self {
        Self::new(BackendErrorKind::Closed, CLOSED_CONNECTION_MESSAGES[1])
    }

    /// Error returned when a transaction is used after it finished.
    pub fn inactive() -> Self {
        Self::new(
            BackendErrorKind::InvalidState,
            "The transaction has already finished",
        )
    }

    /// Error returned when a write is staged in a read-only transaction.
    pub fn read_only() -> Self {
        Self::new(
            BackendErrorKind::ReadOnly,
            "The transaction is read-only",
        )
    }

    /// Returns true when the error means the connection must be reopened.
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        self.kind == BackendErrorKind::Closed
            || CLOSED_CONNECTION_MESSAGES
                .iter()
                .any(|pattern| self.message.contains(pattern))
    }
}

/// Classified store failure.
///
/// This is what `get_many`, `set_many`, `clear` and the `on_error` hook see.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The deadline of an operation elapsed before the backend answered.
    #[error("{operation} request timed out")]
    Timeout { operation: &'static str },

    /// A structural conflict that only another session can resolve.
    #[error("blocked: {message}")]
    Blocked { message: String },

    /// The backend closed the connection.
    #[error("connection closed: {message}")]
    ConnectionClosed { message: String },

    /// The grouped operation was aborted.
    #[error("{operation} was aborted")]
    Aborted { operation: &'static str },

    /// The collection could not be created on first open.
    #[error("failed to provision collection '{collection}': {message}")]
    ProvisioningFailed { collection: String, message: String },

    /// Any other backend failure, with a rewritten message.
    #[error("{kind}: {message}")]
    Unknown {
        kind: BackendErrorKind,
        message: String,
    },
}

impl StoreError {
    /// Create a timeout error.
    pub fn timeout(operation: &'static str) -> Self {
        Self::Timeout { operation }
    }

    /// Create a provisioning error.
    pub fn provisioning_failed(collection: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProvisioningFailed {
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// Returns false for failures that no amount of local retrying resolves.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Blocked { .. })
    }

    /// Returns true when the connection must be reopened before retrying.
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Blocked { .. } => "blocked",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::Aborted { .. } => "aborted",
            Self::ProvisioningFailed { .. } => "provisioning_failed",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// Classify a backend failure that happened while running `operation`.
pub fn classify(operation: &'static str, error: BackendError) -> StoreError {
    if error.is_connection_closed() {
        return StoreError::ConnectionClosed {
            message: error.message,
        };
    }

    match error.kind {
        BackendErrorKind::Blocked => StoreError::Blocked {
            message: error.message,
        },
        BackendErrorKind::Abort => StoreError::Aborted { operation },
        BackendErrorKind::Timeout => StoreError::Timeout { operation },
        kind => StoreError::Unknown {
            kind,
            message: rewrite_message(kind, &error.message),
        },
    }
}

/// Add context to backend messages that are obscure on their own.
pub fn rewrite_message(kind: BackendErrorKind, message: &str) -> String {
    if message.is_empty() {
        return "Unknown storage backend error".to_string();
    }

    if kind == BackendErrorKind::InvalidState {
        return format!(
            "Unable to open a storage connection. This could be due to running in a \
             private or sandboxed session whose storage is not available: \"{message}\""
        );
    }

    message.to_string()
}
