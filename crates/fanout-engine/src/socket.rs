//! Client socket seam.
//!
//! The engine only ever writes framed JSON and closes with a status code; the
//! accept path, the authentication handshake, and the read side all belong to
//! the socket owner.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

use fanout_wire::TransactionPayload;

/// Errors surfaced by a socket write.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The peer is gone or the transport refused the write.
    #[error("socket write failed: {0}")]
    Write(String),
}

/// A duplex message channel to one client.
#[async_trait]
pub trait ClientSocket: Send + Sync + 'static {
    /// Writes one framed JSON message.
    async fn send(&self, frame: String) -> Result<(), SocketError>;

    /// Closes the socket with a status code from [`fanout_wire::status`].
    async fn close(&self, status: u16);
}

/// A socket that records frames instead of writing them.
///
/// Useful for tests: assert on [`RecordingSocket::payloads`] after driving
/// the engine, or inject write failures with
/// [`RecordingSocket::fail_sends`].
#[derive(Debug, Default)]
pub struct RecordingSocket {
    frames: Mutex<Vec<String>>,
    close_status: Mutex<Option<u16>>,
    fail_sends: AtomicBool,
}

impl RecordingSocket {
    /// Creates a new recording socket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the raw frames sent so far.
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().expect("lock poisoned").clone()
    }

    /// Returns the number of frames sent so far.
    pub fn sent_count(&self) -> usize {
        self.frames.lock().expect("lock poisoned").len()
    }

    /// Decodes every sent frame as a transaction payload.
    pub fn payloads(&self) -> Vec<TransactionPayload> {
        self.frames()
            .iter()
            .map(|frame| serde_json::from_str(frame).expect("frame is not a payload"))
            .collect()
    }

    /// Returns the close status, if the engine closed this socket.
    pub fn close_status(&self) -> Option<u16> {
        *self.close_status.lock().expect("lock poisoned")
    }

    /// Makes subsequent sends fail, simulating a dead peer.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClientSocket for RecordingSocket {
    async fn send(&self, frame: String) -> Result<(), SocketError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SocketError::Write("injected write failure".to_string()));
        }
        self.frames.lock().expect("lock poisoned").push(frame);
        Ok(())
    }

    async fn close(&self, status: u16) {
        *self.close_status.lock().expect("lock poisoned") = Some(status);
    }
}
