//! Terminal client for a Tether conversation.
//!
//! Lines typed on stdin are sent to the agent; replies, connection changes and
//! errors are printed as they arrive. `/reconnect` forces a fresh connection,
//! `/quit` (or end of input) closes the session.
//!
//!   tether --server http://localhost:8000 --session demo

use anyhow::Context;
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tether_client::{
    ClientConfig, ConversationSession, FileStore, KeyValueStore, MemoryStore, SessionBuilder,
    SessionEvent,
};
use tether_core::{MessageStatus, Sender, SessionId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Chat with an agent over a Tether session")]
struct Cli {
    /// Backend base URL
    #[arg(short, long, env = "TETHER_SERVER", default_value = "http://localhost:8000")]
    server: String,

    /// Session id (a new one is generated when omitted)
    #[arg(long, env = "TETHER_SESSION")]
    session: Option<SessionId>,

    /// Socket URL, if it is not the one derived from the server URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// File for cached history and the offline queue (in memory when omitted)
    #[arg(long, env = "TETHER_CACHE")]
    cache: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tether_client=warn".parse()?)
                .add_directive("tether_cli=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let store: Arc<dyn KeyValueStore> = match &cli.cache {
        Some(path) => Arc::new(
            FileStore::open(path).with_context(|| format!("opening cache {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let session_id = cli.session.unwrap_or_else(SessionId::generate);

    let mut builder = SessionBuilder::new(session_id.clone())
        .base_url(&cli.server)
        .store(store)
        .config(config);
    if let Some(endpoint) = cli.endpoint {
        builder = builder.endpoint(endpoint);
    }
    tracing::info!(session = %session_id, server = %cli.server, "opening session");
    let session = Arc::new(builder.open().await?);
    println!("session {session_id} ({})", session.connection_state());

    let printer = tokio::spawn(print_events(session.clone()));
    let result = read_input(&session).await;

    session.close().await;
    printer.abort();
    tracing::info!(session = %session_id, queued = session.queue_len(), "session closed");
    result
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<ClientConfig> {
    let Some(path) = path else {
        return Ok(ClientConfig::default());
    };
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config = toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

async fn read_input(session: &ConversationSession) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/reconnect" => {
                if let Err(e) = session.reconnect().await {
                    tracing::warn!(error = %e, "manual reconnect failed");
                    eprintln!("! {e}");
                }
            }
            "/history" => {
                for message in session.messages() {
                    let who = match message.sender {
                        Sender::User => "you",
                        Sender::Agent => "agent",
                    };
                    println!("[{}] {who}: {}", message.timestamp.format("%H:%M:%S"), message.content);
                }
            }
            text => {
                if let Err(e) = session.send_message(text).await {
                    eprintln!("! {e}");
                }
            }
        }
    }
    Ok(())
}

/// Print what the session reports. Agent messages are printed once, when
/// complete; failed user messages once, with their reason.
async fn print_events(session: Arc<ConversationSession>) {
    let mut events = session.subscribe();
    let mut shown: HashSet<String> = session.messages().into_iter().map(|m| m.id).collect();
    loop {
        match events.recv().await {
            Ok(SessionEvent::StateChanged(state)) => println!("-- {state}"),
            Ok(SessionEvent::Typing(true)) => println!("-- agent is typing"),
            Ok(SessionEvent::Typing(false)) => {}
            Ok(SessionEvent::Error(message)) => println!("! {message}"),
            Ok(SessionEvent::MessagesChanged) => {
                for message in session.messages() {
                    if message.is_pending() || shown.contains(&message.id) {
                        continue;
                    }
                    match (message.sender, message.status) {
                        (Sender::Agent, _) => println!("agent: {}", message.content),
                        (Sender::User, MessageStatus::Error) => println!(
                            "! not delivered: {} ({})",
                            message.content,
                            message.error_message().unwrap_or("unknown error")
                        ),
                        (Sender::User, _) => {}
                    }
                    shown.insert(message.id);
                }
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "event printer fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
