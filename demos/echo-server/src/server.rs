//! Echo backend implementation.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tether_core::{
    ConnectionAck, ErrorFrame, MessageFormat, MessageFrame, Payload, Sender, StreamFrame,
    TypingFrame, WireMessage,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

type Sink = SplitSink<WebSocketStream<TcpStream>, Message>;

pub async fn run(addr: SocketAddr, chunk_delay_ms: u64) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on ws://{}", addr);
    let chunk_delay = Duration::from_millis(chunk_delay_ms);

    loop {
        let (stream, client_addr) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, client_addr, chunk_delay).await {
                tracing::warn!("Connection error from {}: {}", client_addr, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    chunk_delay: Duration,
) -> anyhow::Result<()> {
    let mut path = String::new();
    let record_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, record_path).await?;
    let session_id = path
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("anonymous")
        .to_string();
    let (mut sink, mut stream) = ws.split();

    tracing::info!(session = %session_id, "{} connected", addr);
    send(
        &mut sink,
        Payload::ConnectionAck(ConnectionAck {
            session_id: session_id.clone(),
            server_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
    )
    .await?;

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("WebSocket error: {}", e);
                break;
            }
        };
        let wire = match WireMessage::parse(&text) {
            Ok(wire) => wire,
            Err(e) => {
                tracing::warn!("Invalid frame: {}", e);
                continue;
            }
        };
        match wire.payload {
            Payload::Ping => send(&mut sink, Payload::Pong).await?,
            Payload::Message(frame) => answer(&mut sink, frame, chunk_delay).await?,
            other => tracing::debug!(kind = other.kind(), "ignoring frame"),
        }
    }

    tracing::info!(session = %session_id, "{} disconnected", addr);
    Ok(())
}

/// Acknowledge a user message and stream an echo back, or fail on request.
async fn answer(sink: &mut Sink, frame: MessageFrame, chunk_delay: Duration) -> anyhow::Result<()> {
    if let Some(code) = frame.content.strip_prefix("/fail ") {
        let code = code.trim().to_string();
        tracing::info!(id = %frame.message_id, code = %code, "failing message on request");
        return send(
            sink,
            Payload::Error(ErrorFrame {
                message: format!("failure {code} requested by the client"),
                code,
                related_message_id: Some(frame.message_id),
                retryable: false,
            }),
        )
        .await;
    }

    send(
        sink,
        Payload::Message(MessageFrame {
            sender: Some(Sender::User),
            ..frame.clone()
        }),
    )
    .await?;
    send(sink, Payload::Typing(TypingFrame { is_typing: true })).await?;

    let reply_id = uuid::Uuid::new_v4().to_string();
    let reply = format!("You said: {}", frame.content);
    let words: Vec<&str> = reply.split_inclusive(' ').collect();
    for (i, word) in words.iter().enumerate() {
        tokio::time::sleep(chunk_delay).await;
        send(
            sink,
            Payload::Stream(StreamFrame {
                message_id: reply_id.clone(),
                reply_to: frame.message_id.clone(),
                chunk: word.to_string(),
                is_complete: i + 1 == words.len(),
                format: Some(MessageFormat::Markdown),
            }),
        )
        .await?;
    }

    send(sink, Payload::Typing(TypingFrame { is_typing: false })).await
}

async fn send(sink: &mut Sink, payload: Payload) -> anyhow::Result<()> {
    let text = WireMessage::now(payload).to_text()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
