//! # fanout-engine
//!
//! Real-time fan-out of encrypted database transactions: every transaction
//! committed to the shared durable log is delivered to each subscribed client
//! socket exactly once, in strictly increasing sequence order, with vacant
//! sequence-number slots repaired by synthetic rollback records.
//!
//! ## Non-negotiable principles
//!
//! - **The durable log is the only truth** - routing tables are process-local
//!   and rebuilt from scratch on restart
//! - **Per-database delivery is gap-free** - a missing sequence number is
//!   either delivered later or materialized as a `Rollback` record
//! - **Per-connection faults stay per-connection** - a broadcast never fails
//!   because one subscriber's socket or push did
//!
//! ## Architecture
//!
//! ```text
//! COMMIT:
//!   producer → durable log → Registry::broadcast
//!
//! FAN-OUT:
//!   broadcast → subscribers → push pipeline → socket
//!
//! CATCH-UP:
//!   open → snapshot bundle + log query → socket
//! ```
//!
//! ## Crate structure
//!
//! - [`registry`] - Process-wide routing table and the broadcast entry point
//! - [`connection`] - Per-socket state and the push pipeline
//! - [`bucket`] - Per-connection token buckets
//! - [`store`] - Durable log and snapshot store seams
//! - [`socket`] - Client socket seam
//! - [`config`] - Engine tunables

pub mod bucket;
pub mod config;
pub mod connection;
pub mod registry;
pub mod socket;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

pub use bucket::TokenBucket;
pub use config::EngineConfig;
pub use connection::{Connection, OpenDatabase, PushMode};
pub use registry::Registry;
pub use socket::{ClientSocket, RecordingSocket, SocketError};
pub use store::{
    BundleStore, LogPage, MemoryBundleStore, MemoryTransactionLog, StoreError, TransactionLog,
};
pub use types::{AdminId, AppId, ClientId, ConnectionId, UserId};

/// Errors that can occur in the fan-out engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Durable store query or put failed; the next broadcast retries.
    #[error("durable store error: {0}")]
    Store(#[from] store::StoreError),

    /// Socket write failed; surfaces to the socket owner.
    #[error("socket error: {0}")]
    Socket(#[from] socket::SocketError),

    /// Payload could not be encoded for the wire.
    #[error("payload encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// A live connection already exists for this client ID.
    #[error("client already connected: {0}")]
    ClientAlreadyConnected(types::ClientId),

    /// The request or file-storage bucket denied admission.
    #[error("rate limited")]
    RateLimited,
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
