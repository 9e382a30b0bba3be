//! Wire envelope.
//!
//! Every frame on the socket is a JSON object
//! `{"type": ..., "payload": {...}, "timestamp": ...}`. The `type` decides
//! which payload struct applies; the envelope itself carries nothing else.

use crate::{MessageFormat, Sender};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

/// A parsed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

/// Frame body, discriminated by the envelope's `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    ConnectionAck(ConnectionAck),
    Ping,
    Pong,
    Message(MessageFrame),
    Typing(TypingFrame),
    Stream(StreamFrame),
    Error(ErrorFrame),
    Disconnect(DisconnectFrame),
}

impl Payload {
    /// The `type` tag this payload is sent under.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::ConnectionAck(_) => "connection_ack",
            Payload::Ping => "ping",
            Payload::Pong => "pong",
            Payload::Message(_) => "message",
            Payload::Typing(_) => "typing",
            Payload::Stream(_) => "stream",
            Payload::Error(_) => "error",
            Payload::Disconnect(_) => "disconnect",
        }
    }
}

/// Sent by the server once the socket is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionAck {
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
}

/// A complete chat message, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFrame {
    #[serde(alias = "id")]
    pub message_id: String,
    pub content: String,
    #[serde(default)]
    pub format: MessageFormat,
    #[serde(default, alias = "role", skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingFrame {
    #[serde(default)]
    pub is_typing: bool,
}

/// One piece of an agent reply that is still being generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    #[serde(alias = "id")]
    pub message_id: String,
    #[serde(default)]
    pub reply_to: String,
    #[serde(alias = "content")]
    pub chunk: String,
    #[serde(default, alias = "is_final")]
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<MessageFormat>,
}

/// A backend-reported failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(alias = "error_code")]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_message_id: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

/// The server is about to drop the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectFrame {
    #[serde(default)]
    pub reason: String,
    #[serde(default = "normal_close")]
    pub code: u16,
}

fn normal_close() -> u16 {
    1000
}

/// Why a text frame could not be turned into a [`WireMessage`].
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no `type`")]
    MissingType,
    #[error("frame has no `timestamp`")]
    MissingTimestamp,
    #[error("invalid timestamp {value:?}: {source}")]
    InvalidTimestamp {
        value: String,
        source: chrono::ParseError,
    },
    #[error("unknown frame type {0:?}")]
    UnknownType(String),
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        source: serde_json::Error,
    },
}

impl FrameError {
    /// Unknown types are expected from newer servers and are not worth a warning.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, FrameError::UnknownType(_))
    }
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default, alias = "data")]
    payload: Option<Value>,
    timestamp: Option<String>,
}

#[derive(Serialize)]
struct OutFrame<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: Value,
    timestamp: String,
}

impl WireMessage {
    /// Stamp a payload with an explicit instant.
    pub fn at(timestamp: DateTime<Utc>, payload: Payload) -> Self {
        Self { timestamp, payload }
    }

    /// Stamp a payload with the current instant.
    pub fn now(payload: Payload) -> Self {
        Self::at(Utc::now(), payload)
    }

    pub fn ping() -> Self {
        Self::now(Payload::Ping)
    }

    pub fn pong() -> Self {
        Self::now(Payload::Pong)
    }

    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let kind = raw.kind.ok_or(FrameError::MissingType)?;
        let stamp = raw.timestamp.ok_or(FrameError::MissingTimestamp)?;
        let timestamp = parse_timestamp(&stamp).map_err(|source| FrameError::InvalidTimestamp {
            value: stamp.clone(),
            source,
        })?;

        let body = match raw.payload {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(v) => v,
        };
        let payload = match kind.as_str() {
            "connection_ack" | "connection" => Payload::ConnectionAck(decode(&kind, body)?),
            "ping" => Payload::Ping,
            "pong" => Payload::Pong,
            "message" => Payload::Message(decode(&kind, body)?),
            "typing" => Payload::Typing(decode(&kind, body)?),
            "stream" => Payload::Stream(decode(&kind, body)?),
            "error" => Payload::Error(decode(&kind, body)?),
            "disconnect" => Payload::Disconnect(decode(&kind, body)?),
            _ => return Err(FrameError::UnknownType(kind)),
        };

        Ok(Self { timestamp, payload })
    }

    /// Serialize to a text frame.
    pub fn to_text(&self) -> Result<String, FrameError> {
        let payload = match &self.payload {
            Payload::ConnectionAck(p) => serde_json::to_value(p)?,
            Payload::Ping | Payload::Pong => Value::Object(Map::new()),
            Payload::Message(p) => serde_json::to_value(p)?,
            Payload::Typing(p) => serde_json::to_value(p)?,
            Payload::Stream(p) => serde_json::to_value(p)?,
            Payload::Error(p) => serde_json::to_value(p)?,
            Payload::Disconnect(p) => serde_json::to_value(p)?,
        };
        let out = OutFrame {
            kind: self.payload.kind(),
            payload,
            timestamp: format_timestamp(&self.timestamp),
        };
        Ok(serde_json::to_string(&out)?)
    }
}

impl FromStr for WireMessage {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, body: Value) -> Result<T, FrameError> {
    serde_json::from_value(body).map_err(|source| FrameError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

/// Parse an ISO-8601 instant. Timestamps without an offset are taken as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(err) => NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| err),
    }
}

/// Format an instant as RFC 3339 UTC, keeping every significant fractional digit.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
