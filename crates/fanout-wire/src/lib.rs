//! # fanout-wire
//!
//! Wire shapes shared between the fan-out engine and its collaborators:
//!
//! - [`record`] - The durable transaction record, exactly as it is stored in
//!   the shared log (hyphenated attribute names, sort key `sequence-no`).
//! - [`payload`] - The JSON envelope pushed to client sockets
//!   (`ApplyTransactions`), with transactions projected to camelCase.
//! - [`status`] - Socket close status codes.
//!
//! This crate contains data and serde only; all I/O lives in the engine.

pub mod payload;
pub mod record;
pub mod status;

pub use payload::{TransactionPayload, WireTransaction, APPLY_TRANSACTIONS_ROUTE};
pub use record::{DatabaseId, TransactionRecord, ROLLBACK_COMMAND};
