//! End-to-end behaviour of [`Store`] over an in-memory backend.
//!
//! Covers the store's observable contract:
//! - Read-your-writes and the empty/set/clear scenario
//! - Healthy backends never degrade the store
//! - Exhausted retries degrade it and persist the marker
//! - A marked pair is reconciled with exactly one backend clear
//! - Closed connections are reopened transparently
//!
//! Run with:
//! ```bash
//! cargo test --test store_tests
//! ```

#[path = "common.rs"]
mod common;

use common::{COLLECTION, DATABASE, TestHarness, fast_config};
use proptest::prelude::*;
use serde_json::{Value, json};
use serial_test::serial;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use steadykv::backend::MemoryBackend;
use steadykv::store::{CacheRegistry, MarkerRegistry};
use steadykv::{BackendErrorKind, Store, StoreError, StoreMode};

fn absent(keys: &[&str]) -> HashMap<String, Option<Value>> {
    keys.iter().map(|key| (key.to_string(), None)).collect()
}

// =============================================================================
// Healthy Backend
// =============================================================================

/// Empty store, then one write, then a clear.
#[tokio::test]
async fn test_get_set_clear_scenario() {
    let harness = TestHarness::new();
    let store = harness.open().await;

    assert_eq!(store.get_many(["A", "B"]).await.unwrap(), absent(&["A", "B"]));

    store.set_many([("A", json!(true))]).await.unwrap();
    let values = store.get_many(["A", "B"]).await.unwrap();
    assert_eq!(values["A"], Some(json!(true)));
    assert_eq!(values["B"], None);

    store.clear().await.unwrap();
    assert_eq!(store.get_many(["A", "B"]).await.unwrap(), absent(&["A", "B"]));

    assert_eq!(store.mode(), StoreMode::Live);
    assert_eq!(harness.error_count(), 0);
}

#[tokio::test]
async fn test_empty_key_list() {
    let harness = TestHarness::new();
    let store = harness.open().await;

    assert!(store.get_many(Vec::<String>::new()).await.unwrap().is_empty());
    store.set_many(Vec::<(String, Value)>::new()).await.unwrap();
    assert_eq!(store.mode(), StoreMode::Live);
}

/// Repeated traffic against a healthy backend never flips the mode.
#[tokio::test]
async fn test_healthy_backend_never_degrades() {
    let harness = TestHarness::new();
    let store = harness.open().await;

    for i in 0..1000 {
        store.set_many([(format!("k{}", i % 7), json!(i))]).await.unwrap();
        store.get_many([format!("k{}", i % 7)]).await.unwrap();
        if i % 100 == 0 {
            store.clear().await.unwrap();
        }
    }

    assert_eq!(store.mode(), StoreMode::Live);
    assert!(!harness.markers.is_marked(DATABASE, COLLECTION));
    assert_eq!(harness.error_count(), 0);
}

/// Writes within one batch are atomic and later writes win.
#[tokio::test]
async fn test_set_many_last_write_wins() {
    let harness = TestHarness::new();
    let store = harness.open().await;

    store
        .set_many([("a", json!(1)), ("b", json!(2)), ("a", json!(3))])
        .await
        .unwrap();

    let stored = harness.memory.entries(DATABASE, COLLECTION).unwrap();
    assert_eq!(stored.get("a"), Some(&json!(3)));
    assert_eq!(stored.get("b"), Some(&json!(2)));
    assert_eq!(harness.backend.commit_calls(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// After any sequence of writes, reads return the last written value
    /// of each written key and nothing for untouched keys.
    #[test]
    fn prop_read_your_writes(
        batches in prop::collection::vec(
            prop::collection::vec(("[a-e]", any::<i32>()), 0..4),
            1..6,
        ),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let harness = TestHarness::new();
            let store = harness.open().await;
            let mut expected: BTreeMap<String, Value> = BTreeMap::new();

            for batch in &batches {
                let entries: Vec<(String, Value)> = batch
                    .iter()
                    .map(|(key, n)| (key.clone(), json!(n)))
                    .collect();
                store.set_many(entries.clone()).await.unwrap();
                expected.extend(entries);
            }

            let keys = ["a", "b", "c", "d", "e", "untouched"];
            let values = store.get_many(keys).await.unwrap();
            for key in keys {
                prop_assert_eq!(values[key].as_ref(), expected.get(key));
            }
            prop_assert_eq!(store.mode(), StoreMode::Live);
            Ok(())
        })?;
    }
}

// =============================================================================
// Degradation
// =============================================================================

/// The first call to exhaust its retries degrades the store; every later
/// call is answered by the cache without touching the backend.
#[tokio::test]
async fn test_exhausted_retries_degrade_store() {
    let harness = TestHarness::new();
    let store = harness.open().await;
    store.set_many([("kept", json!("before"))]).await.unwrap();

    harness.backend.fail_requests(BackendErrorKind::Unknown, None);
    let transactions_before = harness.backend.transaction_calls();

    store.set_many([("new", json!(1))]).await.unwrap();

    assert_eq!(store.mode(), StoreMode::Degraded);
    assert!(harness.markers.is_marked(DATABASE, COLLECTION));
    assert_eq!(harness.error_count(), 1);
    assert_eq!(
        harness.backend.transaction_calls() - transactions_before,
        store.config().transaction_retries,
        "one transaction per attempt"
    );

    let frozen = (harness.backend.transaction_calls(), harness.backend.open_calls());
    let values = store.get_many(["kept", "new", "missing"]).await.unwrap();
    assert_eq!(values["kept"], Some(json!("before")));
    assert_eq!(values["new"], Some(json!(1)));
    assert_eq!(values["missing"], None);

    store.set_many([("later", json!(2))]).await.unwrap();
    store.refresh().await.unwrap();
    store.clear().await.unwrap();
    assert!(store.get_many(["kept"]).await.unwrap()["kept"].is_none());

    assert_eq!(
        (harness.backend.transaction_calls(), harness.backend.open_calls()),
        frozen,
        "degraded store must not reach the backend"
    );
    assert_eq!(harness.error_count(), 1);
}

/// A transient failure within the retry budget is invisible.
#[tokio::test]
async fn test_recovered_failure_does_not_degrade() {
    let harness = TestHarness::new();
    let store = harness.open_with(fast_config().with_transaction_retries(3)).await;

    harness.backend.fail_requests(BackendErrorKind::Unknown, Some(2));
    store.set_many([("a", json!(1))]).await.unwrap();

    assert_eq!(store.mode(), StoreMode::Live);
    assert!(!harness.markers.is_marked(DATABASE, COLLECTION));
    assert_eq!(harness.backend.transaction_calls(), 3);
}

#[tokio::test]
async fn test_blocked_open_is_not_retried() {
    let harness = TestHarness::new();
    harness.backend.fail_opens(BackendErrorKind::Blocked, None);

    let store = harness.open().await;

    assert_eq!(store.mode(), StoreMode::Degraded);
    assert_eq!(harness.backend.open_calls(), 1);
    assert!(matches!(
        harness.errors.lock().first(),
        Some(StoreError::Blocked { .. })
    ));
}

#[tokio::test]
async fn test_failed_provisioning_starts_degraded() {
    let harness = TestHarness::new();
    harness.backend.fail_opens(BackendErrorKind::Constraint, None);

    let store = harness.open().await;

    assert_eq!(store.mode(), StoreMode::Degraded);
    assert!(matches!(
        harness.errors.lock().first(),
        Some(StoreError::ProvisioningFailed { .. })
    ));

    store.set_many([("a", json!(1))]).await.unwrap();
    assert_eq!(store.get_many(["a"]).await.unwrap()["a"], Some(json!(1)));
}

// =============================================================================
// Reconciliation
// =============================================================================

/// A marked pair gets exactly one backend clear before any other traffic.
#[tokio::test]
async fn test_reconciliation_clears_once_before_other_traffic() {
    let harness = TestHarness::new();
    harness.memory.insert(DATABASE, COLLECTION, "partial", json!("stale"));
    harness.markers.mark(DATABASE, COLLECTION);

    let store = harness.open().await;

    assert_eq!(store.mode(), StoreMode::Live);
    assert_eq!(harness.backend.transaction_calls(), 1);
    assert_eq!(harness.backend.clear_calls(), 1);
    assert!(!harness.markers.is_marked(DATABASE, COLLECTION));
    assert!(harness.memory.entries(DATABASE, COLLECTION).unwrap().is_empty());

    assert_eq!(store.get_many(["partial"]).await.unwrap()["partial"], None);
    assert_eq!(harness.backend.clear_calls(), 1);
}

/// A degraded session marks the pair; the next store reconciles it.
#[tokio::test]
async fn test_degraded_session_is_reconciled_by_next_store() {
    let harness = TestHarness::new();
    let first = harness.open().await;
    first.set_many([("a", json!(1))]).await.unwrap();

    harness.backend.fail_requests(BackendErrorKind::Unknown, None);
    first.set_many([("b", json!(2))]).await.unwrap();
    assert_eq!(first.mode(), StoreMode::Degraded);

    harness.backend.heal();
    let second = harness.open().await;

    assert_eq!(second.mode(), StoreMode::Live);
    assert!(!harness.markers.is_marked(DATABASE, COLLECTION));
    assert!(harness.memory.entries(DATABASE, COLLECTION).unwrap().is_empty());
    assert_eq!(second.get_many(["a", "b"]).await.unwrap(), absent(&["a", "b"]));
}

/// A failed reconciliation is attempted once and leaves the marker set.
#[tokio::test]
async fn test_failed_reconciliation_keeps_marker() {
    let harness = TestHarness::new();
    harness.markers.mark(DATABASE, COLLECTION);
    harness.backend.fail_requests(BackendErrorKind::Unknown, None);

    let store = harness.open().await;

    assert_eq!(store.mode(), StoreMode::Degraded);
    assert_eq!(harness.backend.clear_calls(), 1);
    assert!(harness.markers.is_marked(DATABASE, COLLECTION));
    assert_eq!(harness.error_count(), 1);
}

// =============================================================================
// Session
// =============================================================================

/// The backend closing the connection leads to one transparent reopen.
#[tokio::test]
async fn test_closed_connection_is_reopened() {
    let harness = TestHarness::new();
    let store = harness.open().await;
    store.set_many([("a", json!(1))]).await.unwrap();
    assert_eq!(harness.backend.open_calls(), 1);

    assert_eq!(harness.memory.close_connections(), 1);

    assert_eq!(store.get_many(["a"]).await.unwrap()["a"], Some(json!(1)));
    assert_eq!(store.mode(), StoreMode::Live);
    assert_eq!(harness.backend.open_calls(), 2);
}

/// Explicit close followed by more calls reopens on demand.
#[tokio::test]
async fn test_close_then_reuse() {
    let harness = TestHarness::new();
    let store = harness.open().await;

    store.close().await;
    store.set_many([("a", json!(1))]).await.unwrap();

    assert_eq!(store.mode(), StoreMode::Live);
    assert_eq!(harness.backend.open_calls(), 2);
}

/// Concurrent calls on clones of one store share a single connection.
#[tokio::test]
async fn test_concurrent_clones_share_connection() {
    let harness = TestHarness::new();
    let store = harness.open().await;

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.set_many([(format!("k{i}"), json!(i))]).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(harness.backend.open_calls(), 1);
    assert_eq!(harness.memory.entries(DATABASE, COLLECTION).unwrap().len(), 16);
}

// =============================================================================
// Cache Registry
// =============================================================================

#[tokio::test]
async fn test_stores_share_cache_per_pair() {
    let harness = TestHarness::new();
    let first = harness.open().await;
    let second = harness.open().await;
    let other = harness.open_pair(DATABASE, "other", fast_config()).await;

    first.set_many([("shared", json!(1))]).await.unwrap();

    assert_eq!(second.cached_entries().get("shared"), Some(&json!(1)));
    assert!(other.cached_entries().is_empty());
    assert_eq!(harness.registry.len(), 2);
}

/// Stores built without a registry share the process-wide one.
#[tokio::test]
#[serial]
async fn test_default_registry_is_process_wide() {
    let backend = Arc::new(MemoryBackend::new());
    let first = Store::builder(backend.clone(), "registry-test", "global")
        .open()
        .await;
    let second = Store::builder(backend, "registry-test", "global").open().await;

    first.set_many([("k", json!("v"))]).await.unwrap();
    assert_eq!(second.cached_entries().get("k"), Some(&json!("v")));

    CacheRegistry::global().remove("registry-test", "global");
}
