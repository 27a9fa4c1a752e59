//! steadykv - resilient key-value store client.
//!
//! Wraps an asynchronous, transactional storage backend that may hang, drop
//! its connection or fail transiently, and keeps `get_many`/`set_many`/`clear`
//! predictable on top of it:
//!
//! - every backend call is bounded by a deadline and aborted when it expires
//! - failed calls are retried, closed connections are reopened
//! - when the backend keeps failing, an in-process cache takes over and the
//!   store is marked for reconciliation on its next start
//!
//! # Modules
//!
//! - [`backend`] - Backend traits and the memory, redb and fault-injecting backends
//! - [`store`] - The [`Store`] facade, fallback cache and mode machine
//! - [`reliability`] - Deadlines, retries and liveness probes
//! - [`config`] - [`StoreConfig`] and `config.toml` loading
//! - [`error`] - [`StoreError`] and backend error classification

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod constants;
pub mod error;
pub mod metrics;
pub mod paths;
pub mod reliability;
pub mod store;

pub use config::StoreConfig;
pub use error::{BackendError, BackendErrorKind, Result, StoreError};
pub use store::{Store, StoreBuilder, StoreMode};
