//! Socket close status codes.
//!
//! Application codes live in the websocket close-code range reserved for
//! libraries and frameworks (3000-3999); 1000 is the protocol's normal
//! closure.

/// Clean shutdown initiated by the server.
pub const NORMAL_CLOSURE: u16 = 1000;

/// A second socket tried to register an already-connected client ID.
pub const CLIENT_ALREADY_CONNECTED: u16 = 3001;
