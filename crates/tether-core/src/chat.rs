//! Conversation records.
//!
//! [`ChatMessage`] is what the ledger stores and the UI renders;
//! [`QueuedMessage`] is what the offline queue holds while there is no
//! connection to send it over.

use crate::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Longest message content accepted from the user, in characters.
pub const MAX_CONTENT_CHARS: usize = 10_000;

/// Metadata key holding the code language when the format is `code`.
pub const META_LANGUAGE: &str = "language";
/// Metadata key holding the user-facing reason when the status is `error`.
pub const META_ERROR_MESSAGE: &str = "errorMessage";
/// Metadata key holding the id the server assigned to a local message.
pub const META_SERVER_ID: &str = "serverId";

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    /// The remote agent. Backend `system` notices are shown as agent output.
    #[serde(alias = "system")]
    Agent,
}

/// How message content should be rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    #[default]
    Plain,
    Markdown,
    Code,
}

/// Delivery status. `Sending` moves to one of the terminal states exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Error,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MessageStatus::Sending)
    }
}

/// A message in the conversation ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: SessionId,
    pub sender: Sender,
    pub content: String,
    #[serde(default)]
    pub format: MessageFormat,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ChatMessage {
    /// A message the local user is about to send.
    pub fn outgoing(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::outgoing_with_id(uuid::Uuid::new_v4().to_string(), session_id, content)
    }

    /// A local outgoing message with a caller-chosen id (e.g. the offline queue's).
    pub fn outgoing_with_id(
        id: impl Into<String>,
        session_id: SessionId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id,
            sender: Sender::User,
            content: content.into(),
            format: MessageFormat::Plain,
            timestamp: Utc::now(),
            status: MessageStatus::Sending,
            metadata: Map::new(),
        }
    }

    /// A message that arrived from the backend and is therefore already sent.
    pub fn received(
        id: impl Into<String>,
        session_id: SessionId,
        sender: Sender,
        content: impl Into<String>,
        format: MessageFormat,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id,
            sender,
            content: content.into(),
            format,
            timestamp,
            status: MessageStatus::Sent,
            metadata: Map::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Sending
    }

    /// Move from `sending` to `sent`. Returns false if the status was already terminal.
    pub fn mark_sent(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = MessageStatus::Sent;
        self.metadata.remove(META_ERROR_MESSAGE);
        true
    }

    /// Move from `sending` to `error`, recording the user-facing reason.
    pub fn mark_error(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = MessageStatus::Error;
        self.metadata
            .insert(META_ERROR_MESSAGE.to_string(), Value::String(reason.into()));
        true
    }

    pub fn error_message(&self) -> Option<&str> {
        self.metadata.get(META_ERROR_MESSAGE).and_then(Value::as_str)
    }

    pub fn language(&self) -> Option<&str> {
        self.metadata.get(META_LANGUAGE).and_then(Value::as_str)
    }

    /// Sort key of the ledger: timestamp first, id as the tie-break.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.id.as_str())
    }
}

/// An outbound message waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub content: String,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl QueuedMessage {
    pub fn new(content: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            session_id,
            timestamp: Utc::now(),
            retry_count: 0,
        }
    }
}
