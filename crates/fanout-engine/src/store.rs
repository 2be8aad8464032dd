//! Durable store seams.
//!
//! The transaction log and the snapshot store are shared across processes;
//! their contents are the authoritative truth. The only cross-process
//! coordination the engine relies on is the conditional insert of
//! [`TransactionLog::put_if_vacant`].

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound::{Excluded, Included};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

use fanout_wire::{DatabaseId, TransactionRecord};

/// Errors surfaced by the durable stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not serve the request; the caller retries later.
    #[error("durable store unavailable: {0}")]
    Unavailable(String),

    /// No snapshot bundle exists at the requested sequence number.
    #[error("missing bundle for {database_id} at {bundle_seq_no}")]
    MissingBundle {
        database_id: DatabaseId,
        bundle_seq_no: i64,
    },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// One page of a log query, ordered by ascending sequence number.
#[derive(Debug, Clone, Default)]
pub struct LogPage {
    pub records: Vec<TransactionRecord>,
    /// Exclusive-start key for the next page; `None` when the query is
    /// drained.
    pub next: Option<i64>,
}

/// The shared durable transaction log.
#[async_trait]
pub trait TransactionLog: Send + Sync + 'static {
    /// Records of `database_id` with `sequence_no > exclusive_start`, one
    /// page at a time in ascending order.
    async fn page_after(
        &self,
        database_id: &DatabaseId,
        exclusive_start: i64,
    ) -> StoreResult<LogPage>;

    /// Inserts `record` only if its `(database_id, sequence_no)` slot is
    /// vacant. Returns `false` when another record already occupies the slot,
    /// so at most one of a rollback and a late real write wins it.
    async fn put_if_vacant(&self, record: TransactionRecord) -> StoreResult<bool>;
}

/// The snapshot blob store.
#[async_trait]
pub trait BundleStore: Send + Sync + 'static {
    /// Fetches the snapshot bundle written at `bundle_seq_no`.
    async fn bundle(&self, database_id: &DatabaseId, bundle_seq_no: i64) -> StoreResult<Vec<u8>>;
}

/// In-memory transaction log.
///
/// Backs tests the way the real table backs production: records sort by
/// `(database_id, sequence_no)` and queries paginate. Fault injection mirrors
/// the failure modes the engine must tolerate: [`fail_requests`] makes every
/// store call error, and [`hide`] keeps a record out of query pages while
/// still occupying its slot for conditional puts (a write that landed after
/// the reader's query).
///
/// [`fail_requests`]: MemoryTransactionLog::fail_requests
/// [`hide`]: MemoryTransactionLog::hide
#[derive(Debug)]
pub struct MemoryTransactionLog {
    records: Mutex<BTreeMap<(DatabaseId, i64), TransactionRecord>>,
    hidden: Mutex<HashSet<(DatabaseId, i64)>>,
    page_size: usize,
    page_queries: AtomicUsize,
    fail_requests: AtomicBool,
}

impl MemoryTransactionLog {
    /// Default records per page.
    pub const DEFAULT_PAGE_SIZE: usize = 100;

    /// Creates an empty log with the default page size.
    pub fn new() -> Self {
        Self::with_page_size(Self::DEFAULT_PAGE_SIZE)
    }

    /// Creates an empty log that serves `page_size` records per query.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            hidden: Mutex::new(HashSet::new()),
            page_size,
            page_queries: AtomicUsize::new(0),
            fail_requests: AtomicBool::new(false),
        }
    }

    /// Inserts a record unconditionally (test seeding).
    pub fn insert(&self, record: TransactionRecord) {
        self.records
            .lock()
            .expect("lock poisoned")
            .insert((record.database_id.clone(), record.sequence_no), record);
    }

    /// Returns every record of a database in sequence order.
    pub fn records(&self, database_id: &DatabaseId) -> Vec<TransactionRecord> {
        self.records
            .lock()
            .expect("lock poisoned")
            .range((
                Included((database_id.clone(), i64::MIN)),
                Included((database_id.clone(), i64::MAX)),
            ))
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Number of page queries served so far.
    pub fn page_queries(&self) -> usize {
        self.page_queries.load(Ordering::SeqCst)
    }

    /// Makes every subsequent store call fail.
    pub fn fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Hides a record from query pages while its slot stays occupied.
    pub fn hide(&self, database_id: &DatabaseId, sequence_no: i64) {
        self.hidden
            .lock()
            .expect("lock poisoned")
            .insert((database_id.clone(), sequence_no));
    }

    /// Makes a hidden record visible to query pages again.
    pub fn reveal(&self, database_id: &DatabaseId, sequence_no: i64) {
        self.hidden
            .lock()
            .expect("lock poisoned")
            .remove(&(database_id.clone(), sequence_no));
    }
}

impl Default for MemoryTransactionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionLog for MemoryTransactionLog {
    async fn page_after(
        &self,
        database_id: &DatabaseId,
        exclusive_start: i64,
    ) -> StoreResult<LogPage> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        self.page_queries.fetch_add(1, Ordering::SeqCst);

        let records = self.records.lock().expect("lock poisoned");
        let hidden = self.hidden.lock().expect("lock poisoned");

        let mut page = Vec::with_capacity(self.page_size);
        let mut more = false;
        for (key, record) in records.range((
            Excluded((database_id.clone(), exclusive_start)),
            Included((database_id.clone(), i64::MAX)),
        )) {
            if hidden.contains(key) {
                continue;
            }
            if page.len() == self.page_size {
                more = true;
                break;
            }
            page.push(record.clone());
        }

        let next = if more {
            page.last().map(|r: &TransactionRecord| r.sequence_no)
        } else {
            None
        };
        Ok(LogPage {
            records: page,
            next,
        })
    }

    async fn put_if_vacant(&self, record: TransactionRecord) -> StoreResult<bool> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let mut records = self.records.lock().expect("lock poisoned");
        let key = (record.database_id.clone(), record.sequence_no);
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(key, record);
        Ok(true)
    }
}

/// In-memory snapshot store.
#[derive(Debug, Default)]
pub struct MemoryBundleStore {
    bundles: Mutex<HashMap<(DatabaseId, i64), Vec<u8>>>,
}

impl MemoryBundleStore {
    /// Creates an empty bundle store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a bundle (test seeding).
    pub fn put(&self, database_id: DatabaseId, bundle_seq_no: i64, bytes: Vec<u8>) {
        self.bundles
            .lock()
            .expect("lock poisoned")
            .insert((database_id, bundle_seq_no), bytes);
    }
}

#[async_trait]
impl BundleStore for MemoryBundleStore {
    async fn bundle(&self, database_id: &DatabaseId, bundle_seq_no: i64) -> StoreResult<Vec<u8>> {
        self.bundles
            .lock()
            .expect("lock poisoned")
            .get(&(database_id.clone(), bundle_seq_no))
            .cloned()
            .ok_or_else(|| StoreError::MissingBundle {
                database_id: database_id.clone(),
                bundle_seq_no,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(db: &str, seq: i64) -> TransactionRecord {
        TransactionRecord::new(DatabaseId::from(db), seq, "Insert")
    }

    #[tokio::test]
    async fn pages_are_ordered_and_bounded() {
        let log = MemoryTransactionLog::with_page_size(2);
        for seq in [3, 1, 2, 5, 4] {
            log.insert(record("db-1", seq));
        }
        log.insert(record("db-2", 1));

        let page = log.page_after(&DatabaseId::from("db-1"), 1).await.unwrap();
        let seqs: Vec<i64> = page.records.iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(page.next, Some(3));

        let page = log.page_after(&DatabaseId::from("db-1"), 3).await.unwrap();
        let seqs: Vec<i64> = page.records.iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(page.next, None);
    }

    #[tokio::test]
    async fn conditional_put_respects_occupied_slots() {
        let log = MemoryTransactionLog::new();
        let db = DatabaseId::from("db-1");

        assert!(log.put_if_vacant(record("db-1", 1)).await.unwrap());
        assert!(!log
            .put_if_vacant(TransactionRecord::rollback(db.clone(), 1))
            .await
            .unwrap());

        // The original record survives the losing rollback.
        assert_eq!(log.records(&db)[0].command, "Insert");
    }

    #[tokio::test]
    async fn hidden_records_occupy_slots_but_skip_pages() {
        let log = MemoryTransactionLog::new();
        let db = DatabaseId::from("db-1");
        log.insert(record("db-1", 1));
        log.hide(&db, 1);

        let page = log.page_after(&db, 0).await.unwrap();
        assert!(page.records.is_empty());
        assert!(!log.put_if_vacant(record("db-1", 1)).await.unwrap());

        log.reveal(&db, 1);
        let page = log.page_after(&db, 0).await.unwrap();
        assert_eq!(page.records.len(), 1);
    }

    #[tokio::test]
    async fn missing_bundle_is_an_error() {
        let bundles = MemoryBundleStore::new();
        let db = DatabaseId::from("db-1");

        bundles.put(db.clone(), 5, vec![1, 2, 3]);
        assert_eq!(bundles.bundle(&db, 5).await.unwrap(), vec![1, 2, 3]);
        assert!(bundles.bundle(&db, 9).await.is_err());
    }
}
