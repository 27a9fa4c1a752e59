//! Store metrics.
//!
//! Thin wrappers over the `metrics` facade. Nothing is recorded unless the
//! embedding application installs a recorder.

use metrics::counter;

use crate::error::StoreError;
use crate::reliability::OperationKind;
use crate::store::StoreMode;

/// Record the outcome of a store operation.
pub fn record_operation(kind: OperationKind, outcome: &'static str) {
    counter!(
        "steadykv_operations_total",
        "operation" => kind.name(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a failed attempt that is about to be retried.
pub fn record_retry(kind: OperationKind, error: &StoreError) {
    counter!(
        "steadykv_retries_total",
        "operation" => kind.name(),
        "error" => error.label()
    )
    .increment(1);
}

/// Record an operation that hit its deadline.
pub fn record_timeout(kind: OperationKind) {
    counter!("steadykv_timeouts_total", "operation" => kind.name()).increment(1);
}

/// Record a mode transition.
pub fn record_transition(to: StoreMode) {
    counter!("steadykv_mode_transitions_total", "to" => to.name()).increment(1);
}

/// Record a reopen after the backend closed the connection.
pub fn record_reopen() {
    counter!("steadykv_reopens_total").increment(1);
}
