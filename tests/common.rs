//! Shared helpers for steadykv integration tests.
//!
//! Each test builds its own [`TestHarness`] with private markers and a
//! private cache registry, so tests never share state through the
//! process-wide defaults.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use steadykv::backend::{FaultyBackend, MemoryBackend};
use steadykv::store::{CacheRegistry, MemoryMarkers};
use steadykv::{Store, StoreConfig, StoreError};

pub const DATABASE: &str = "app";
pub const COLLECTION: &str = "prefs";

/// In-memory backend behind a fault injector, plus the store's
/// collaborators and a log of reported errors.
pub struct TestHarness {
    pub memory: MemoryBackend,
    pub backend: FaultyBackend,
    pub markers: Arc<MemoryMarkers>,
    pub registry: Arc<CacheRegistry>,
    pub errors: Arc<Mutex<Vec<StoreError>>>,
}

impl TestHarness {
    pub fn new() -> Self {
        let memory = MemoryBackend::new();
        Self {
            backend: FaultyBackend::new(Arc::new(memory.clone())),
            memory,
            markers: Arc::new(MemoryMarkers::new()),
            registry: Arc::new(CacheRegistry::new()),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Opens a store on the default pair with fast retries.
    pub async fn open(&self) -> Store {
        self.open_with(fast_config()).await
    }

    pub async fn open_with(&self, config: StoreConfig) -> Store {
        self.open_pair(DATABASE, COLLECTION, config).await
    }

    pub async fn open_pair(&self, database: &str, collection: &str, config: StoreConfig) -> Store {
        let errors = self.errors.clone();
        Store::builder(Arc::new(self.backend.clone()), database, collection)
            .config(config)
            .markers(self.markers.clone())
            .registry(self.registry.clone())
            .on_error(move |err| errors.lock().push(err.clone()))
            .open()
            .await
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Default config with a short backoff so retrying tests stay fast.
pub fn fast_config() -> StoreConfig {
    StoreConfig {
        retry_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..StoreConfig::default()
    }
}

/// Scheduling slack allowed on top of a deadline.
pub const EPSILON: Duration = Duration::from_millis(50);
