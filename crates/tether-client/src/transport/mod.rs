//! Socket primitive.
//!
//! The connection manager never talks to a concrete socket library. It asks a
//! [`Transport`] for a [`Socket`] and then reads [`SocketEvent`]s from it until
//! the socket reports that it is closed.

mod memory;
mod ws;

pub use memory::{MemoryListener, MemoryPeer, MemoryTransport};
pub use ws::WsTransport;

use crate::TransportError;
use async_trait::async_trait;

/// Opens sockets.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Box<dyn Socket>, TransportError>;
}

/// One open socket.
#[async_trait]
pub trait Socket: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Wait for the next event. Must be cancel-safe. Once `Closed` or `Error`
    /// has been returned the socket is dead and is not polled again.
    async fn recv(&mut self) -> SocketEvent;

    /// Close from our side. Idempotent.
    async fn close(&mut self);
}

/// What a socket can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message(String),
    Closed { code: u16, reason: String },
    Error(String),
}

/// Close code used when a socket vanishes without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;
