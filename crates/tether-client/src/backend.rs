//! REST side of the backend: message history and the fallback send route.

use crate::{BackendError, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tether_core::{ChatMessage, MessageFormat, Sender, SessionId, parse_timestamp};

const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Authoritative history and the non-socket delivery route.
#[async_trait]
pub trait SessionBackend: Send + Sync + 'static {
    /// Messages the server holds for the session, oldest first.
    async fn fetch_history(&self, session_id: &SessionId) -> Result<Vec<ChatMessage>, BackendError>;

    /// Deliver a user message without the socket. Returns the stored record.
    async fn post_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> Result<ChatMessage, BackendError>;
}

/// [`SessionBackend`] over the backend's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    history_limit: usize,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn messages_url(&self, session_id: &SessionId) -> String {
        messages_url(&self.base_url, session_id)
    }
}

#[async_trait]
impl SessionBackend for HttpBackend {
    async fn fetch_history(&self, session_id: &SessionId) -> Result<Vec<ChatMessage>, BackendError> {
        let response = self
            .client
            .get(self.messages_url(session_id))
            .query(&[("limit", self.history_limit)])
            .send()
            .await?;
        let records: Vec<HistoryRecord> = ok_or_status(response).await?.json().await?;
        tracing::debug!(session = %session_id, count = records.len(), "history fetched");
        records
            .into_iter()
            .map(|record| record.into_message(session_id))
            .collect()
    }

    async fn post_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> Result<ChatMessage, BackendError> {
        let body = PostMessage {
            content,
            role: Sender::User,
        };
        let response = self
            .client
            .post(self.messages_url(session_id))
            .json(&body)
            .send()
            .await?;
        let record: HistoryRecord = ok_or_status(response).await?.json().await?;
        tracing::info!(session = %session_id, id = %record.id, "message delivered over REST");
        record.into_message(session_id)
    }
}

async fn ok_or_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

#[derive(Serialize)]
struct PostMessage<'a> {
    content: &'a str,
    role: Sender,
}

/// Message record as the REST API returns it.
#[derive(Debug, Deserialize)]
struct HistoryRecord {
    id: String,
    role: Sender,
    content: String,
    timestamp: String,
    #[serde(default)]
    format: Option<MessageFormat>,
}

impl HistoryRecord {
    fn into_message(self, session_id: &SessionId) -> Result<ChatMessage, BackendError> {
        let timestamp = parse_timestamp(&self.timestamp).map_err(|e| {
            BackendError::Record(format!("message {} has timestamp {:?}: {e}", self.id, self.timestamp))
        })?;
        Ok(ChatMessage::received(
            self.id,
            session_id.clone(),
            self.role,
            self.content,
            self.format.unwrap_or_default(),
            timestamp,
        ))
    }
}

/// `{base}/api/v1/sessions/{id}/messages`
pub fn messages_url(base_url: &str, session_id: &SessionId) -> String {
    format!(
        "{}/api/v1/sessions/{session_id}/messages",
        base_url.trim_end_matches('/')
    )
}

/// Socket endpoint for a session, derived from the HTTP base URL.
pub fn websocket_url(base_url: &str, session_id: &SessionId) -> Result<String, TransportError> {
    let base = base_url.trim_end_matches('/');
    let (scheme, rest) = base.split_once("://").ok_or_else(|| TransportError::InvalidEndpoint {
        url: base_url.to_string(),
        reason: "missing scheme".to_string(),
    })?;
    let ws_scheme = match scheme {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidEndpoint {
                url: base_url.to_string(),
                reason: format!("unsupported scheme {other:?}"),
            });
        }
    };
    if rest.is_empty() {
        return Err(TransportError::InvalidEndpoint {
            url: base_url.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(format!("{ws_scheme}://{rest}/api/v1/sessions/ws/{session_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::MessageStatus;

    fn session() -> SessionId {
        "abc-123".parse().unwrap()
    }

    #[test]
    fn websocket_url_follows_scheme() {
        assert_eq!(
            websocket_url("http://localhost:8000/", &session()).unwrap(),
            "ws://localhost:8000/api/v1/sessions/ws/abc-123"
        );
        assert_eq!(
            websocket_url("https://chat.example.com", &session()).unwrap(),
            "wss://chat.example.com/api/v1/sessions/ws/abc-123"
        );
        assert!(matches!(
            websocket_url("ftp://x", &session()),
            Err(TransportError::InvalidEndpoint { .. })
        ));
        assert!(websocket_url("localhost:8000", &session()).is_err());
    }

    #[test]
    fn messages_url_trims_slash() {
        assert_eq!(
            messages_url("http://h/", &session()),
            "http://h/api/v1/sessions/abc-123/messages"
        );
    }

    #[test]
    fn history_record_maps_to_sent_message() {
        let json = r#"[
            {"id": "m1", "session_id": "abc-123", "role": "user", "content": "hi",
             "agent_id": null, "timestamp": "2024-05-01T10:00:00.250000", "status": "sent"},
            {"id": "m2", "session_id": "abc-123", "role": "agent", "content": "hello",
             "agent_id": "echo", "timestamp": "2024-05-01T10:00:01Z", "status": "sent"}
        ]"#;
        let records: Vec<HistoryRecord> = serde_json::from_str(json).unwrap();
        let messages: Vec<ChatMessage> = records
            .into_iter()
            .map(|r| r.into_message(&session()).unwrap())
            .collect();

        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[0].timestamp.timestamp_subsec_millis(), 250);
        assert_eq!(messages[1].sender, Sender::Agent);
        assert!(messages.iter().all(|m| m.status == MessageStatus::Sent));
        assert!(messages.iter().all(|m| m.session_id == session()));
    }

    #[test]
    fn bad_timestamp_is_a_record_error() {
        let record: HistoryRecord = serde_json::from_str(
            r#"{"id": "m1", "role": "user", "content": "hi", "timestamp": "yesterday"}"#,
        )
        .unwrap();
        assert!(matches!(
            record.into_message(&session()),
            Err(BackendError::Record(_))
        ));
    }
}
