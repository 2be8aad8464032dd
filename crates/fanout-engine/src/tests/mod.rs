//! Engine integration tests.
//!
//! The harness wires a registry to in-memory stores and recording sockets;
//! the themed modules drive the public surface end to end.


mod broadcast;
mod snapshot;
