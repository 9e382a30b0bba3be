//! Reliable realtime conversation client for Tether.
//!
//! The pieces, bottom up:
//!
//! - [`transport`]: the socket primitive, over WebSocket or in memory.
//! - [`ConnectionManager`]: one socket, reconnect with backoff, heartbeat.
//! - [`CircuitBreaker`] and [`recovery`]: what to do when the backend reports
//!   an error.
//! - [`OfflineQueue`]: outbound messages composed without a connection.
//! - [`MessageLedger`]: the ordered, deduplicated conversation.
//! - [`ConversationSession`]: all of the above for one session id.

pub mod backend;
pub mod breaker;
pub mod config;
pub mod connection;
pub mod connectivity;
mod error;
pub mod ledger;
pub mod queue;
pub mod recovery;
pub mod session;
pub mod store;
pub mod transport;

pub use backend::{HttpBackend, SessionBackend};
pub use breaker::{CircuitBreaker, CircuitState};
pub use config::ClientConfig;
pub use connection::{ConnectionEvent, ConnectionManager};
pub use connectivity::Connectivity;
pub use error::{BackendError, ClientError, StoreError, TransportError};
pub use ledger::MessageLedger;
pub use queue::{OfflineQueue, QueueEvent};
pub use recovery::{ErrorCode, RecoveryDirective, RecoveryStrategy};
pub use session::{ConversationSession, SessionBuilder, SessionEvent};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use tether_core::*;
