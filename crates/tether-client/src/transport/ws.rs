//! WebSocket transport over tokio-tungstenite.

use super::{ABNORMAL_CLOSURE, Socket, SocketEvent, Transport};
use crate::TransportError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Opens `ws://` and `wss://` sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn Socket>, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| connect_error(url, e))?;
        tracing::debug!(url, "websocket open");
        Ok(Box::new(WsSocket { stream }))
    }
}

fn connect_error(url: &str, err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Url(e) => TransportError::InvalidEndpoint {
            url: url.to_string(),
            reason: e.to_string(),
        },
        tungstenite::Error::Io(e) => TransportError::Refused(e.to_string()),
        other => TransportError::Io(other.to_string()),
    }
}

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Socket for WsSocket {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> SocketEvent {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return SocketEvent::Error(e.to_string()),
                None => {
                    return SocketEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "stream ended".to_string(),
                    };
                }
            };

            match msg {
                Message::Text(text) => return SocketEvent::Message(text.as_str().to_owned()),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return SocketEvent::Message(text),
                    Err(_) => tracing::warn!(len = bytes.len(), "dropping non-UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (1005, String::new()),
                    };
                    return SocketEvent::Closed { code, reason };
                }
                // Control frames are answered by tungstenite itself.
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "websocket close handshake failed");
        }
    }
}
