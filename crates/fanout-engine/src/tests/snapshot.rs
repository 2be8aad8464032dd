//! Snapshot bundles and the build-bundle trigger.

use super::harness::{seq_nos, tx, TestHarness};
use crate::config::EngineConfig;
use crate::EngineError;
use fanout_wire::DatabaseId;
use serde_json::Value;

fn sized_tx(db: &str, seq: i64, bytes: usize) -> fanout_wire::TransactionRecord {
    let mut record = tx(db, seq);
    record.record = Some(Value::String("x".repeat(bytes)));
    record
}

/// Crossing the 50 KiB delivered-bytes threshold sets `buildBundle` and
/// resets the counter.
#[tokio::test]
async fn build_bundle_set_when_threshold_crossed() {
    let harness = TestHarness::new();
    let db = DatabaseId::from("db-1");
    let (connection, socket) = harness.connect("user-1", "client-1").await;
    harness.open(&connection, "db-1", 0).await.unwrap();

    // ~49 KiB: under the threshold, counter accumulates.
    let big = sized_tx("db-1", 1, 49 * 1024);
    harness.log.insert(big.clone());
    harness.registry.broadcast(&big).await;

    let payloads = socket.payloads();
    assert_eq!(payloads[1].build_bundle, None);
    let state = connection.database_state(&db).await.unwrap();
    assert!(state.transaction_log_size > 49 * 1024);

    // ~2 KiB more crosses 50 KiB: flag set, counter reset.
    let small = sized_tx("db-1", 2, 2 * 1024);
    harness.log.insert(small.clone());
    harness.registry.broadcast(&small).await;

    let payloads = socket.payloads();
    assert_eq!(payloads[2].build_bundle, Some(true));
    let state = connection.database_state(&db).await.unwrap();
    assert_eq!(state.transaction_log_size, 0);
}

/// After a trigger, the next window starts accumulating from zero.
#[tokio::test]
async fn counter_accumulates_again_after_trigger() {
    let config = EngineConfig {
        build_bundle_threshold: 1024,
        ..EngineConfig::default()
    };
    let harness = TestHarness::with_config(config);
    let db = DatabaseId::from("db-1");
    let (connection, socket) = harness.connect("user-1", "client-1").await;
    harness.open(&connection, "db-1", 0).await.unwrap();

    let big = sized_tx("db-1", 1, 2048);
    harness.log.insert(big.clone());
    harness.registry.broadcast(&big).await;
    assert_eq!(socket.payloads()[1].build_bundle, Some(true));

    let small = tx("db-1", 2);
    harness.log.insert(small.clone());
    harness.registry.broadcast(&small).await;

    let payloads = socket.payloads();
    assert_eq!(payloads[2].build_bundle, None);
    let state = connection.database_state(&db).await.unwrap();
    assert!(state.transaction_log_size > 0);
    assert!(state.transaction_log_size < 1024);
}

/// A missing bundle aborts the open push; the database stays open and
/// subscribed so a later reopen can recover.
#[tokio::test]
async fn missing_bundle_aborts_open_push() {
    let harness = TestHarness::new();
    let db = DatabaseId::from("db-1");
    let (connection, socket) = harness.connect("user-1", "client-1").await;

    let result = harness.open(&connection, "db-1", 5).await;
    assert!(matches!(result, Err(EngineError::Store(_))));
    assert_eq!(socket.sent_count(), 0);
    assert!(connection.is_open(&db).await);
    assert_eq!(harness.registry.subscriber_count(&db), 1);
}

/// The snapshot rides only on the first delivery of a fresh socket; later
/// pushes never re-attach it.
#[tokio::test]
async fn bundle_is_attached_only_once() {
    let harness = TestHarness::new();
    let db = DatabaseId::from("db-1");
    harness.bundles.put(db.clone(), 5, b"bundle".to_vec());
    harness.seed("db-1", 6..=6);

    let (connection, socket) = harness.connect("user-1", "client-1").await;
    harness.open(&connection, "db-1", 5).await.unwrap();

    let record = tx("db-1", 7);
    harness.log.insert(record.clone());
    harness.registry.broadcast(&record).await;

    let payloads = socket.payloads();
    assert_eq!(payloads.len(), 2);
    assert!(payloads[0].bundle.is_some());
    assert!(payloads[1].bundle.is_none());
    assert!(payloads[1].bundle_seq_no.is_none());
    assert_eq!(seq_nos(&payloads[1]), vec![7]);
}

/// An open with a snapshot but an empty tail delivers the bundle and moves
/// the cursor to the bundle's sequence number.
#[tokio::test]
async fn snapshot_only_open_advances_cursor_to_bundle() {
    let harness = TestHarness::new();
    let db = DatabaseId::from("db-1");
    harness.bundles.put(db.clone(), 5, b"bundle".to_vec());

    let (connection, socket) = harness.connect("user-1", "client-1").await;
    harness.open(&connection, "db-1", 5).await.unwrap();

    let payloads = socket.payloads();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].bundle_seq_no, Some(5));
    assert!(payloads[0].transaction_log.is_empty());

    let state = connection.database_state(&db).await.unwrap();
    assert_eq!(state.last_seq_no, 5);
    assert!(state.init);
}
