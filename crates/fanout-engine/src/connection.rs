//! Per-socket connection state and the push pipeline.
//!
//! A connection owns one delivery cursor per opened database and pushes
//! `ApplyTransactions` envelopes to its socket. The pipeline guarantees that
//! the sequence numbers observed on the socket are strictly increasing with
//! no duplicates and no skipped indices.
//!
//! # Push modes
//!
//! | Mode | Meaning |
//! |------|---------|
//! | `Open` | First sight of the database on this socket; the payload carries the name hash and key. |
//! | `Reopen` | The client already holds the key and resumes at a sequence number. |
//! | `Incremental` | Normal catch-up / fan-out push. |
//!
//! # Interleaving
//!
//! Store queries and socket writes suspend the pushing task, so a concurrent
//! broadcast may advance the cursor or the connection may close mid-push.
//! Three guards keep delivery sound regardless: the whole pipeline runs under
//! a per-connection gate, [`Connection::send_payload`] re-filters the batch
//! against the cursor as it is at send time, and a push whose database
//! vanished aborts silently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use fanout_wire::{DatabaseId, TransactionPayload, TransactionRecord, WireTransaction};

use crate::bucket::TokenBucket;
use crate::config::EngineConfig;
use crate::socket::ClientSocket;
use crate::store::{BundleStore, TransactionLog};
use crate::types::{AdminId, AppId, ClientId, ConnectionId, UserId};
use crate::{EngineError, EngineResult};

/// How a push was invoked.
#[derive(Debug, Clone)]
pub enum PushMode {
    /// The client is seeing this database for the first time on this socket;
    /// the payload must deliver the name hash and the key material.
    Open { db_name_hash: String, db_key: String },
    /// The client already has the key; resume after `seq_no`.
    Reopen { seq_no: i64 },
    /// Normal catch-up / fan-out push.
    Incremental,
}

/// Delivery cursor for one database opened on a connection.
#[derive(Debug, Clone)]
pub struct OpenDatabase {
    /// Sequence number of the last durable snapshot, -1 when none exists.
    pub bundle_seq_no: i64,
    /// Highest sequence number already delivered on this socket. Strictly
    /// non-decreasing over the connection's lifetime.
    pub last_seq_no: i64,
    /// Byte estimate of deltas delivered since the last snapshot trigger.
    pub transaction_log_size: usize,
    /// Set by the first successful push; gates incremental pushes.
    pub init: bool,
    pub db_name_hash: String,
    pub is_owner: bool,
}

/// Per-socket state: opened databases, delivery cursors, rate limiters, and
/// the push pipeline.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    admin_id: AdminId,
    app_id: AppId,
    client_id: ClientId,
    socket: Arc<dyn ClientSocket>,
    log: Arc<dyn TransactionLog>,
    bundles: Arc<dyn BundleStore>,
    config: EngineConfig,
    databases: Mutex<HashMap<DatabaseId, OpenDatabase>>,
    /// Serializes the push pipeline per connection.
    push_gate: Mutex<()>,
    request_bucket: std::sync::Mutex<TokenBucket>,
    storage_bucket: std::sync::Mutex<TokenBucket>,
    /// Owned by the key-exchange collaborator; the engine only reads it.
    key_validated: AtomicBool,
}

enum GapRepair {
    /// Every vacant slot in the gap now holds a rollback record.
    Filled(Vec<TransactionRecord>),
    /// A real write claimed one of the slots after our query.
    LostRace,
}

impl Connection {
    pub(crate) fn new(
        user_id: UserId,
        admin_id: AdminId,
        app_id: AppId,
        client_id: ClientId,
        socket: Arc<dyn ClientSocket>,
        log: Arc<dyn TransactionLog>,
        bundles: Arc<dyn BundleStore>,
        config: EngineConfig,
    ) -> Self {
        let request_bucket =
            TokenBucket::new(config.request_capacity, config.request_refill_per_sec);
        let storage_bucket =
            TokenBucket::new(config.storage_capacity, config.storage_refill_per_sec);

        Self {
            id: ConnectionId::new(),
            user_id,
            admin_id,
            app_id,
            client_id,
            socket,
            log,
            bundles,
            config,
            databases: Mutex::new(HashMap::new()),
            push_gate: Mutex::new(()),
            request_bucket: std::sync::Mutex::new(request_bucket),
            storage_bucket: std::sync::Mutex::new(storage_bucket),
            key_validated: AtomicBool::new(false),
        }
    }

    /// The connection's registration ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn admin_id(&self) -> &AdminId {
        &self.admin_id
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The socket this connection delivers to.
    pub fn socket(&self) -> &Arc<dyn ClientSocket> {
        &self.socket
    }

    /// Whether the key-exchange handshake has completed.
    pub fn key_validated(&self) -> bool {
        self.key_validated.load(Ordering::SeqCst)
    }

    /// Recorded by the key-exchange collaborator when the handshake finishes.
    pub fn set_key_validated(&self, validated: bool) {
        self.key_validated.store(validated, Ordering::SeqCst);
    }

    /// Admits one client request against the request bucket.
    pub fn admit_request(&self) -> EngineResult<()> {
        if self
            .request_bucket
            .lock()
            .expect("lock poisoned")
            .try_acquire()
        {
            Ok(())
        } else {
            Err(EngineError::RateLimited)
        }
    }

    /// Admits one file-storage operation against the storage bucket.
    pub fn admit_file_storage(&self) -> EngineResult<()> {
        if self
            .storage_bucket
            .lock()
            .expect("lock poisoned")
            .try_acquire()
        {
            Ok(())
        } else {
            Err(EngineError::RateLimited)
        }
    }

    /// Initializes the delivery cursor for a database. Idempotent per
    /// connection; reopening starts the cursor at the client's resume point
    /// with `init` already set.
    pub async fn open_database(
        &self,
        database_id: DatabaseId,
        db_name_hash: &str,
        bundle_seq_no: i64,
        reopen_at_seq_no: Option<i64>,
        is_owner: bool,
    ) {
        let mut databases = self.databases.lock().await;
        if databases.contains_key(&database_id) {
            return;
        }

        databases.insert(
            database_id,
            OpenDatabase {
                bundle_seq_no: if bundle_seq_no > 0 { bundle_seq_no } else { -1 },
                last_seq_no: reopen_at_seq_no.unwrap_or(0),
                transaction_log_size: 0,
                init: reopen_at_seq_no.is_some(),
                db_name_hash: db_name_hash.to_string(),
                is_owner,
            },
        );
    }

    /// Whether a database is open on this connection.
    pub async fn is_open(&self, database_id: &DatabaseId) -> bool {
        self.databases.lock().await.contains_key(database_id)
    }

    /// Every database currently open on this connection.
    pub async fn open_database_ids(&self) -> Vec<DatabaseId> {
        self.databases.lock().await.keys().cloned().collect()
    }

    /// The delivery cursor for a database, if open.
    pub async fn database_state(&self, database_id: &DatabaseId) -> Option<OpenDatabase> {
        self.databases.lock().await.get(database_id).cloned()
    }

    /// Drives the full push pipeline for one database: attach a snapshot on a
    /// fresh socket, drain the durable log past the cursor, repair stale
    /// sequence gaps, and ship the result.
    pub async fn push(&self, database_id: &DatabaseId, mode: PushMode) -> EngineResult<()> {
        let _gate = self.push_gate.lock().await;

        let state = match self.database_state(database_id).await {
            Some(state) => state,
            None => return Ok(()),
        };

        let mut payload =
            TransactionPayload::new(database_id.clone(), &state.db_name_hash, state.is_owner);
        if let PushMode::Open {
            db_name_hash,
            db_key,
        } = &mode
        {
            payload.db_name_hash = db_name_hash.clone();
            payload.db_key = Some(db_key.clone());
        }

        // A fresh socket with a durable snapshot starts from the bundle; the
        // cursor then points at the bundle's sequence number.
        let mut seq_cursor = state.last_seq_no;
        let mut bundle_attached = false;
        if state.bundle_seq_no > 0 && state.last_seq_no == 0 {
            let bundle = match self.bundles.bundle(database_id, state.bundle_seq_no).await {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!(database_id = %database_id, error = %e, "snapshot fetch failed, aborting push");
                    return Err(e.into());
                }
            };
            payload.bundle_seq_no = Some(state.bundle_seq_no);
            payload.bundle = Some(bundle);
            seq_cursor = state.bundle_seq_no;
            bundle_attached = true;
        }

        let mut outbound: Vec<TransactionRecord> = Vec::new();
        let mut start = seq_cursor;
        'pages: loop {
            let page = match self.log.page_after(database_id, start).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(database_id = %database_id, error = %e, "log query failed, aborting push");
                    return Err(e.into());
                }
            };

            for record in page.records {
                let sequence_no = record.sequence_no;

                if sequence_no > seq_cursor + 1 {
                    let age = Utc::now().signed_duration_since(record.creation_date);
                    let stale = age
                        .to_std()
                        .map(|age| age > self.config.gap_repair_after)
                        .unwrap_or(false);
                    if !stale {
                        // A young gap is most likely a write still in flight;
                        // halt here and let the next broadcast retry.
                        break 'pages;
                    }

                    match self
                        .rollback(seq_cursor, sequence_no, database_id)
                        .await?
                    {
                        GapRepair::Filled(rolled) => {
                            outbound.extend(
                                rolled
                                    .into_iter()
                                    .filter(|r| r.sequence_no > state.last_seq_no),
                            );
                            outbound.push(record);
                            seq_cursor = sequence_no;
                        }
                        // The slot's record is durable but missing from this
                        // page; halt so the next push delivers it in order.
                        GapRepair::LostRace => break 'pages,
                    }
                } else {
                    if sequence_no > state.last_seq_no {
                        outbound.push(record);
                    }
                    seq_cursor = sequence_no;
                }
            }

            match page.next {
                Some(next) => start = next,
                None => break,
            }
        }

        // Sanity checks against the cursor as it is now; the store queries
        // above may have suspended this task while another push ran.
        {
            let databases = self.databases.lock().await;
            let database = match databases.get(database_id) {
                Some(database) => database,
                None => return Ok(()),
            };
            match &mode {
                PushMode::Open { .. } if database.last_seq_no != 0 => {
                    warn!(
                        database_id = %database_id,
                        last_seq_no = database.last_seq_no,
                        "open push against a non-fresh database, dropping"
                    );
                    return Ok(());
                }
                PushMode::Reopen { seq_no } if database.last_seq_no != *seq_no => {
                    warn!(
                        database_id = %database_id,
                        last_seq_no = database.last_seq_no,
                        reopen_at = seq_no,
                        "reopen resume point out of sync, dropping"
                    );
                    return Ok(());
                }
                PushMode::Incremental if !database.init => {
                    warn!(
                        database_id = %database_id,
                        "incremental push before the database finished opening, dropping"
                    );
                    return Ok(());
                }
                _ => {}
            }
        }

        if outbound.is_empty() {
            if matches!(mode, PushMode::Incremental) {
                return Ok(());
            }

            // An open or reopen ships the envelope even with nothing new: the
            // snapshot and the key material ride on it.
            let frame = serde_json::to_string(&payload)?;
            self.socket.send(frame).await?;

            let mut databases = self.databases.lock().await;
            if let Some(database) = databases.get_mut(database_id) {
                database.init = true;
                if bundle_attached {
                    database.last_seq_no = state.bundle_seq_no;
                }
            }
            return Ok(());
        }

        self.send_payload(payload, outbound, database_id).await
    }

    /// Broadcast fast path: the record is exactly the next expected sequence
    /// number, so it is delivered without a log round trip.
    pub(crate) async fn push_single(&self, record: &TransactionRecord) -> EngineResult<()> {
        let _gate = self.push_gate.lock().await;

        let state = match self.database_state(&record.database_id).await {
            Some(state) => state,
            None => return Ok(()),
        };

        let payload = TransactionPayload::new(
            record.database_id.clone(),
            &state.db_name_hash,
            state.is_owner,
        );
        self.send_payload(payload, vec![record.clone()], &record.database_id)
            .await
    }

    /// Frames a batch and writes it to the socket, advancing the cursor.
    ///
    /// The batch is validated against the cursor at send time, not at the time
    /// it was assembled: the already-delivered prefix is dropped, and a batch
    /// that would not extend the cursor contiguously is rejected wholesale.
    async fn send_payload(
        &self,
        mut payload: TransactionPayload,
        records: Vec<TransactionRecord>,
        database_id: &DatabaseId,
    ) -> EngineResult<()> {
        let mut databases = self.databases.lock().await;
        let database = match databases.get_mut(database_id) {
            Some(database) => database,
            None => return Ok(()),
        };

        let last_seq_no = database.last_seq_no;
        let records: Vec<TransactionRecord> = records
            .into_iter()
            .skip_while(|r| r.sequence_no <= last_seq_no)
            .collect();
        let first = match records.first() {
            Some(record) => record.sequence_no,
            None => return Ok(()),
        };

        if first != database.last_seq_no + 1 && first != database.bundle_seq_no + 1 {
            warn!(
                database_id = %database_id,
                first,
                last_seq_no = database.last_seq_no,
                bundle_seq_no = database.bundle_seq_no,
                "non-contiguous batch, dropping"
            );
            return Ok(());
        }

        let last = records.last().map(|r| r.sequence_no).unwrap_or(first);
        let batch_size: usize = records.iter().map(TransactionRecord::estimated_size).sum();
        let build_bundle =
            database.transaction_log_size + batch_size >= self.config.build_bundle_threshold;
        if build_bundle {
            payload.build_bundle = Some(true);
        }
        payload.transaction_log = records.iter().map(WireTransaction::from_record).collect();

        let frame = serde_json::to_string(&payload)?;
        self.socket.send(frame).await?;

        if build_bundle {
            database.transaction_log_size = 0;
        } else {
            database.transaction_log_size += batch_size;
        }
        database.last_seq_no = last;
        database.init = true;

        debug!(
            database_id = %database_id,
            count = payload.transaction_log.len(),
            last_seq_no = last,
            build_bundle,
            "delivered transactions"
        );
        Ok(())
    }

    /// Claims every vacant slot in `(last_seq_no, this_seq_no)` with a
    /// synthetic rollback record. The conditional put guarantees that at most
    /// one of a rollback and a late real write wins each slot.
    async fn rollback(
        &self,
        last_seq_no: i64,
        this_seq_no: i64,
        database_id: &DatabaseId,
    ) -> EngineResult<GapRepair> {
        let mut rolled = Vec::new();
        for sequence_no in (last_seq_no + 1)..this_seq_no {
            let record = TransactionRecord::rollback(database_id.clone(), sequence_no);
            if self.log.put_if_vacant(record.clone()).await? {
                debug!(database_id = %database_id, sequence_no, "rolled back vacant slot");
                rolled.push(record);
            } else {
                debug!(
                    database_id = %database_id,
                    sequence_no,
                    "rollback slot already claimed by a real write"
                );
                return Ok(GapRepair::LostRace);
            }
        }
        Ok(GapRepair::Filled(rolled))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}
