//! Resilient store built on top of a [`Backend`](crate::backend::Backend).
//!
//! - [`Store`] / [`StoreBuilder`]: `get_many`, `set_many`, `clear`, `refresh`
//! - [`FallbackCache`] / [`CacheRegistry`]: in-process mirror of each collection
//! - [`StoreMode`]: which of backend or cache is authoritative
//! - [`MarkerRegistry`]: durable "needs reconciliation" markers
//!
//! # Example
//!
//! ```ignore
//! use steadykv::backend::MemoryBackend;
//! use steadykv::store::Store;
//!
//! let store = Store::builder(Arc::new(MemoryBackend::new()), "app", "prefs")
//!     .open()
//!     .await;
//! store.set_many([("theme", json!("dark"))]).await?;
//! let values = store.get_many(["theme", "locale"]).await?;
//! ```

mod cache;
mod facade;
mod markers;
mod mode;
mod session;

pub use cache::{CacheRegistry, FallbackCache};
pub use facade::{ErrorHook, Store, StoreBuilder};
pub use markers::{FileMarkers, MarkerRegistry, MemoryMarkers};
pub use mode::StoreMode;
