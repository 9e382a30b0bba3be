//! Core types for Tether.
//!
//! This crate provides the protocol primitives shared by the client and the
//! development server: the wire envelope, the conversation records, and the
//! connection lifecycle. It performs no I/O.

mod chat;
mod session_id;
mod wire;

pub use chat::{
    ChatMessage, MAX_CONTENT_CHARS, META_ERROR_MESSAGE, META_LANGUAGE, META_SERVER_ID,
    MessageFormat, MessageStatus, QueuedMessage, Sender,
};
pub use session_id::{SessionId, SessionIdError};
pub use wire::{
    ConnectionAck, DisconnectFrame, ErrorFrame, FrameError, MessageFrame, Payload, StreamFrame,
    TypingFrame, WireMessage, format_timestamp, parse_timestamp,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket, and none wanted.
    Disconnected,
    /// Opening a socket.
    Connecting,
    /// Socket open, heartbeat running.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Out of attempts. Only a manual reconnect leaves this state.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}
