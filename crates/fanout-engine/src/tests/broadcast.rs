//! Broadcast fan-out: fast path, slow path, and per-connection isolation.

use super::harness::{seq_nos, tx, TestHarness};
use fanout_wire::DatabaseId;

/// The next expected sequence number takes the fast path: one send, no log
/// round trip.
#[tokio::test]
async fn fast_path_skips_the_log() {
    let harness = TestHarness::new();
    let db = DatabaseId::from("db-1");
    harness.bundles.put(db.clone(), 5, b"bundle".to_vec());
    harness.seed("db-1", 6..=8);

    let (connection, socket) = harness.connect("user-1", "client-1").await;
    harness.open(&connection, "db-1", 5).await.unwrap();

    let record = tx("db-1", 9);
    harness.log.insert(record.clone());
    let queries_before = harness.log.page_queries();

    harness.registry.broadcast(&record).await;

    assert_eq!(harness.log.page_queries(), queries_before);

    let payloads = socket.payloads();
    assert_eq!(payloads.len(), 2);
    assert_eq!(seq_nos(&payloads[1]), vec![9]);
    assert!(payloads[1].bundle.is_none());
    assert!(payloads[1].db_key.is_none());

    assert_eq!(connection.database_state(&db).await.unwrap().last_seq_no, 9);
}

/// A sequence number further ahead falls back to the slow path, which
/// re-queries the log and delivers everything pending.
#[tokio::test]
async fn slow_path_requeries_the_log() {
    let harness = TestHarness::new();
    harness.seed("db-1", 1..=3);
    let (connection, socket) = harness.connect("user-1", "client-1").await;
    harness.open(&connection, "db-1", 0).await.unwrap();

    harness.seed("db-1", 4..=5);
    let queries_before = harness.log.page_queries();
    harness.registry.broadcast(&tx("db-1", 5)).await;

    assert!(harness.log.page_queries() > queries_before);

    let payloads = socket.payloads();
    assert_eq!(payloads.len(), 2);
    assert_eq!(seq_nos(&payloads[1]), vec![4, 5]);
    assert_eq!(
        connection
            .database_state(&DatabaseId::from("db-1"))
            .await
            .unwrap()
            .last_seq_no,
        5
    );
}

/// Every subscriber of the database receives the broadcast.
#[tokio::test]
async fn fanout_reaches_all_subscribers() {
    let harness = TestHarness::new();
    let (conn_a, socket_a) = harness.connect("user-a", "client-a").await;
    let (conn_b, socket_b) = harness.connect("user-b", "client-b").await;

    harness.open(&conn_a, "db-1", 0).await.unwrap();
    harness.open(&conn_b, "db-1", 0).await.unwrap();

    let record = tx("db-1", 1);
    harness.log.insert(record.clone());
    harness.registry.broadcast(&record).await;

    assert_eq!(seq_nos(&socket_a.payloads()[1]), vec![1]);
    assert_eq!(seq_nos(&socket_b.payloads()[1]), vec![1]);
}

/// A dead socket on one subscriber never blocks delivery to the others.
#[tokio::test]
async fn failures_stay_per_connection() {
    let harness = TestHarness::new();
    let (conn_a, socket_a) = harness.connect("user-a", "client-a").await;
    let (conn_b, socket_b) = harness.connect("user-b", "client-b").await;

    harness.open(&conn_a, "db-1", 0).await.unwrap();
    harness.open(&conn_b, "db-1", 0).await.unwrap();
    socket_a.fail_sends(true);

    let record = tx("db-1", 1);
    harness.log.insert(record.clone());
    harness.registry.broadcast(&record).await;

    let db = DatabaseId::from("db-1");
    assert_eq!(socket_a.sent_count(), 1);
    assert_eq!(conn_a.database_state(&db).await.unwrap().last_seq_no, 0);

    assert_eq!(seq_nos(&socket_b.payloads()[1]), vec![1]);
    assert_eq!(conn_b.database_state(&db).await.unwrap().last_seq_no, 1);
}

/// Broadcasting to a database nobody opened is a no-op.
#[tokio::test]
async fn unsubscribed_database_is_ignored() {
    let harness = TestHarness::new();
    let (_connection, socket) = harness.connect("user-1", "client-1").await;

    harness.registry.broadcast(&tx("db-ghost", 1)).await;

    assert_eq!(socket.sent_count(), 0);
    assert_eq!(harness.log.page_queries(), 0);
}

/// Subscriptions are per-database: a broadcast only reaches connections that
/// opened that database.
#[tokio::test]
async fn broadcast_respects_database_boundaries() {
    let harness = TestHarness::new();
    let (conn_a, socket_a) = harness.connect("user-a", "client-a").await;
    let (conn_b, socket_b) = harness.connect("user-b", "client-b").await;

    harness.open(&conn_a, "db-1", 0).await.unwrap();
    harness.open(&conn_b, "db-2", 0).await.unwrap();

    let record = tx("db-1", 1);
    harness.log.insert(record.clone());
    harness.registry.broadcast(&record).await;

    assert_eq!(socket_a.sent_count(), 2);
    assert_eq!(socket_b.sent_count(), 1);
}
