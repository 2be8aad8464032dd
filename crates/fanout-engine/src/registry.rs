//! Process-wide routing table and the broadcast entry point.
//!
//! The registry is the sole owner of live [`Connection`]s. Four index maps
//! reference them by connection ID (user, admin, app, database) so teardown
//! in [`Registry::close`] walks them uniformly; none of this state survives a
//! restart.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, warn};

use fanout_wire::{status, DatabaseId, TransactionRecord};

use crate::config::EngineConfig;
use crate::connection::{Connection, PushMode};
use crate::socket::ClientSocket;
use crate::store::{BundleStore, TransactionLog};
use crate::types::{AdminId, AppId, ClientId, ConnectionId, UserId};
use crate::{EngineError, EngineResult};

#[derive(Default)]
struct UserBucket {
    connections: HashSet<ConnectionId>,
    /// Recently uploaded file IDs, each with an eviction deadline.
    file_ids: HashMap<String, Instant>,
}

#[derive(Default)]
struct Indices {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    users: HashMap<UserId, UserBucket>,
    admins: HashMap<AdminId, HashMap<ConnectionId, UserId>>,
    apps: HashMap<AppId, HashMap<ConnectionId, UserId>>,
    databases: HashMap<DatabaseId, HashMap<ConnectionId, UserId>>,
    unique_clients: HashSet<ClientId>,
}

/// Process-wide connection registry and fan-out dispatcher.
pub struct Registry {
    log: Arc<dyn TransactionLog>,
    bundles: Arc<dyn BundleStore>,
    config: EngineConfig,
    state: Mutex<Indices>,
}

impl Registry {
    /// Creates a registry over the shared durable stores.
    pub fn new(
        log: Arc<dyn TransactionLog>,
        bundles: Arc<dyn BundleStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            log,
            bundles,
            config,
            state: Mutex::new(Indices::default()),
        }
    }

    /// Registers a socket as a new connection.
    ///
    /// A client ID may hold at most one live connection: a duplicate is
    /// refused, its socket closed with *Client Already Connected*, and no
    /// connection is created.
    pub async fn register(
        &self,
        user_id: UserId,
        socket: Arc<dyn ClientSocket>,
        client_id: ClientId,
        admin_id: AdminId,
        app_id: AppId,
    ) -> EngineResult<Arc<Connection>> {
        let created = {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.unique_clients.contains(&client_id) {
                None
            } else {
                let connection = Arc::new(Connection::new(
                    user_id.clone(),
                    admin_id.clone(),
                    app_id.clone(),
                    client_id.clone(),
                    socket.clone(),
                    Arc::clone(&self.log),
                    Arc::clone(&self.bundles),
                    self.config.clone(),
                ));
                let id = connection.id();

                state.connections.insert(id, Arc::clone(&connection));
                state
                    .users
                    .entry(user_id.clone())
                    .or_default()
                    .connections
                    .insert(id);
                state
                    .admins
                    .entry(admin_id)
                    .or_default()
                    .insert(id, user_id.clone());
                state
                    .apps
                    .entry(app_id)
                    .or_default()
                    .insert(id, user_id.clone());
                state.unique_clients.insert(client_id.clone());
                Some(connection)
            }
        };

        match created {
            Some(connection) => {
                debug!(
                    user_id = %connection.user_id(),
                    connection_id = %connection.id(),
                    "registered connection"
                );
                Ok(connection)
            }
            None => {
                warn!(client_id = %client_id, "client already connected, refusing socket");
                socket.close(status::CLIENT_ALREADY_CONNECTED).await;
                Err(EngineError::ClientAlreadyConnected(client_id))
            }
        }
    }

    /// Opens a database on a connection and catches the client up.
    ///
    /// No-op for an unknown connection. The connection is subscribed to the
    /// database even when the catch-up push fails; later broadcasts drive
    /// recovery.
    #[allow(clippy::too_many_arguments)]
    pub async fn open_database(
        &self,
        user_id: &UserId,
        connection_id: ConnectionId,
        database_id: &DatabaseId,
        bundle_seq_no: i64,
        db_name_hash: &str,
        db_key: &str,
        reopen_at_seq_no: Option<i64>,
        is_owner: bool,
    ) -> EngineResult<()> {
        let connection = match self.connection_of_user(user_id, connection_id) {
            Some(connection) => connection,
            None => return Ok(()),
        };

        if !connection.is_open(database_id).await {
            connection
                .open_database(
                    database_id.clone(),
                    db_name_hash,
                    bundle_seq_no,
                    reopen_at_seq_no,
                    is_owner,
                )
                .await;
        }

        let mode = match reopen_at_seq_no {
            Some(seq_no) => PushMode::Reopen { seq_no },
            None => PushMode::Open {
                db_name_hash: db_name_hash.to_string(),
                db_key: db_key.to_string(),
            },
        };
        let pushed = connection.push(database_id, mode).await;
        if let Err(e) = &pushed {
            warn!(
                database_id = %database_id,
                connection_id = %connection_id,
                error = %e,
                "catch-up push failed"
            );
        }

        {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.connections.contains_key(&connection_id) {
                state
                    .databases
                    .entry(database_id.clone())
                    .or_default()
                    .insert(connection_id, user_id.clone());
            }
        }
        pushed
    }

    /// Whether a database is open on a user's connection.
    pub async fn is_database_open(
        &self,
        user_id: &UserId,
        connection_id: ConnectionId,
        database_id: &DatabaseId,
    ) -> bool {
        match self.connection_of_user(user_id, connection_id) {
            Some(connection) => connection.is_open(database_id).await,
            None => false,
        }
    }

    /// Fan-out entry point for a just-committed transaction.
    ///
    /// Subscribers whose cursor sits exactly one behind the record take the
    /// fast path (no store round trip); everyone else re-queries the log
    /// through an incremental push. Per-connection failures are logged and
    /// never surface to the producer.
    pub async fn broadcast(&self, transaction: &TransactionRecord) {
        let subscribers: Vec<Arc<Connection>> = {
            let state = self.state.lock().expect("lock poisoned");
            match state.databases.get(&transaction.database_id) {
                Some(bucket) => bucket
                    .keys()
                    .filter_map(|id| state.connections.get(id))
                    .cloned()
                    .collect(),
                None => return,
            }
        };

        for connection in subscribers {
            let result = match connection.database_state(&transaction.database_id).await {
                Some(database) if transaction.sequence_no == database.last_seq_no + 1 => {
                    connection.push_single(transaction).await
                }
                Some(_) => {
                    connection
                        .push(&transaction.database_id, PushMode::Incremental)
                        .await
                }
                None => Ok(()),
            };

            if let Err(e) = result {
                warn!(
                    database_id = %transaction.database_id,
                    connection_id = %connection.id(),
                    error = %e,
                    "push failed during broadcast"
                );
            }
        }
    }

    /// Tears down every index entry for a connection: database buckets first,
    /// then the identity buckets, then the unique-client guard. The owning
    /// entry is removed last, after the sequence is complete.
    pub async fn close(&self, connection_id: ConnectionId) {
        let connection = {
            let state = self.state.lock().expect("lock poisoned");
            state.connections.get(&connection_id).cloned()
        };
        let connection = match connection {
            Some(connection) => connection,
            None => return,
        };

        let open = connection.open_database_ids().await;

        let mut state = self.state.lock().expect("lock poisoned");
        for database_id in open {
            if let Some(bucket) = state.databases.get_mut(&database_id) {
                bucket.remove(&connection_id);
                if bucket.is_empty() {
                    state.databases.remove(&database_id);
                }
            }
        }

        if let Some(bucket) = state.users.get_mut(connection.user_id()) {
            bucket.connections.remove(&connection_id);
            if bucket.connections.is_empty() {
                state.users.remove(connection.user_id());
            }
        }
        if let Some(bucket) = state.admins.get_mut(connection.admin_id()) {
            bucket.remove(&connection_id);
            if bucket.is_empty() {
                state.admins.remove(connection.admin_id());
            }
        }
        if let Some(bucket) = state.apps.get_mut(connection.app_id()) {
            bucket.remove(&connection_id);
            if bucket.is_empty() {
                state.apps.remove(connection.app_id());
            }
        }

        state.unique_clients.remove(connection.client_id());
        state.connections.remove(&connection_id);

        debug!(connection_id = %connection_id, "connection closed");
    }

    /// Closes every socket belonging to a user.
    ///
    /// Only the sockets are closed here; registry teardown happens when each
    /// socket owner feeds the close event back into [`Registry::close`].
    pub async fn close_users_connected_clients(&self, user_id: &UserId) {
        let connections: Vec<Arc<Connection>> = {
            let state = self.state.lock().expect("lock poisoned");
            match state.users.get(user_id) {
                Some(bucket) => bucket
                    .connections
                    .iter()
                    .filter_map(|id| state.connections.get(id))
                    .cloned()
                    .collect(),
                None => return,
            }
        };

        for connection in connections {
            connection.socket().close(status::NORMAL_CLOSURE).await;
        }
    }

    /// Closes every socket registered under an admin.
    pub async fn close_admins_connected_clients(&self, admin_id: &AdminId) {
        let connections: Vec<Arc<Connection>> = {
            let state = self.state.lock().expect("lock poisoned");
            match state.admins.get(admin_id) {
                Some(bucket) => bucket
                    .keys()
                    .filter_map(|id| state.connections.get(id))
                    .cloned()
                    .collect(),
                None => return,
            }
        };

        for connection in connections {
            connection.socket().close(status::NORMAL_CLOSURE).await;
        }
    }

    /// Closes every socket registered under an app.
    pub async fn close_apps_connected_clients(&self, app_id: &AppId) {
        let connections: Vec<Arc<Connection>> = {
            let state = self.state.lock().expect("lock poisoned");
            match state.apps.get(app_id) {
                Some(bucket) => bucket
                    .keys()
                    .filter_map(|id| state.connections.get(id))
                    .cloned()
                    .collect(),
                None => return,
            }
        };

        for connection in connections {
            connection.socket().close(status::NORMAL_CLOSURE).await;
        }
    }

    /// Remembers a recently uploaded file ID for a user. The entry evicts
    /// `file_id_ttl` after the most recent touch.
    pub fn cache_file_id(&self, user_id: &UserId, file_id: &str) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("lock poisoned");
        let bucket = match state.users.get_mut(user_id) {
            Some(bucket) => bucket,
            None => return,
        };

        bucket.file_ids.retain(|_, deadline| *deadline > now);
        bucket
            .file_ids
            .insert(file_id.to_string(), now + self.config.file_id_ttl);
    }

    /// Sliding-window membership test: a hit re-arms the eviction deadline.
    pub fn is_file_id_cached(&self, user_id: &UserId, file_id: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().expect("lock poisoned");
        let bucket = match state.users.get_mut(user_id) {
            Some(bucket) => bucket,
            None => return false,
        };

        bucket.file_ids.retain(|_, deadline| *deadline > now);
        match bucket.file_ids.get_mut(file_id) {
            Some(deadline) => {
                *deadline = now + self.config.file_id_ttl;
                true
            }
            None => false,
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").connections.len()
    }

    /// Number of connections subscribed to a database.
    pub fn subscriber_count(&self, database_id: &DatabaseId) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state
            .databases
            .get(database_id)
            .map(|bucket| bucket.len())
            .unwrap_or(0)
    }

    /// Number of connections registered under a user.
    pub fn user_connection_count(&self, user_id: &UserId) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state
            .users
            .get(user_id)
            .map(|bucket| bucket.connections.len())
            .unwrap_or(0)
    }

    /// Number of connections registered under an admin.
    pub fn admin_connection_count(&self, admin_id: &AdminId) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state
            .admins
            .get(admin_id)
            .map(|bucket| bucket.len())
            .unwrap_or(0)
    }

    /// Number of connections registered under an app.
    pub fn app_connection_count(&self, app_id: &AppId) -> usize {
        let state = self.state.lock().expect("lock poisoned");
        state
            .apps
            .get(app_id)
            .map(|bucket| bucket.len())
            .unwrap_or(0)
    }

    /// Whether a live connection exists for a client ID.
    pub fn is_client_connected(&self, client_id: &ClientId) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state.unique_clients.contains(client_id)
    }

    fn connection_of_user(
        &self,
        user_id: &UserId,
        connection_id: ConnectionId,
    ) -> Option<Arc<Connection>> {
        let state = self.state.lock().expect("lock poisoned");
        let known = state
            .users
            .get(user_id)
            .map(|bucket| bucket.connections.contains(&connection_id))
            .unwrap_or(false);
        if !known {
            return None;
        }
        state.connections.get(&connection_id).cloned()
    }
}
