//! Reliability primitives for talking to an unreliable backend.
//!
//! - [`deadline`]: exactly-once, deadline-bounded execution with abort
//! - [`retry`]: bounded retries with exponential backoff
//! - [`probe`]: liveness probes run before opening a backend

pub mod deadline;
pub mod probe;
pub mod retry;

pub use deadline::{OperationKind, execute, resolve_within};
pub use probe::{LivenessProbe, NoopProbe, PollingProbe, needs_liveness_probe};
pub use retry::{RetryConfig, retry_async, retry_with_hook};
