//! Error types.

use tether_core::FrameError;

/// Failure of the socket primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The socket could not even be constructed (bad URL, unsupported scheme).
    #[error("invalid endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("socket closed")]
    Closed,
    #[error("socket error: {0}")]
    Io(String),
}

impl TransportError {
    /// Construction failures are not retried automatically.
    pub fn is_construction(&self) -> bool {
        matches!(self, TransportError::InvalidEndpoint { .. })
    }
}

/// Failure of the key-value collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure talking to the REST history backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed record: {0}")]
    Record(String),
}

/// Errors surfaced to users of the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("message content cannot be empty")]
    EmptyMessage,
    #[error("message is {len} characters long, the limit is {max}")]
    MessageTooLong { len: usize, max: usize },
    #[error("not connected")]
    NotConnected,
    #[error("no endpoint has been set")]
    NoEndpoint,
    #[error("operation cancelled")]
    Cancelled,
    #[error("connection manager has shut down")]
    Shutdown,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}
