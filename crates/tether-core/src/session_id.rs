//! Conversation session identifiers.
//!
//! A session id is opaque to the client: the backend mints it (usually a
//! UUID) and the client only needs it to be non-empty and free of
//! whitespace, since it is spliced into URLs and storage keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of one conversation with an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Create a fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = SessionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(SessionIdError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(SessionIdError::Whitespace(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Error parsing a session id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionIdError {
    #[error("session id cannot be empty")]
    Empty,
    #[error("session id cannot contain whitespace, got: {0:?}")]
    Whitespace(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_uuid() {
        let id: SessionId = "a3e24ba5-480a-4f63-b0dc-8699e1bb78a4".parse().unwrap();
        assert_eq!(id.as_str(), "a3e24ba5-480a-4f63-b0dc-8699e1bb78a4");
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        assert_eq!("".parse::<SessionId>(), Err(SessionIdError::Empty));
        assert!(matches!(
            "abc def".parse::<SessionId>(),
            Err(SessionIdError::Whitespace(_))
        ));
    }

    #[test]
    fn serde_rejects_invalid() {
        let ok: SessionId = serde_json::from_str("\"s-1\"").unwrap();
        assert_eq!(ok.to_string(), "s-1");
        assert!(serde_json::from_str::<SessionId>("\"\"").is_err());
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
