//! In-process loopback transport.
//!
//! Every successful `open` hands a [`MemoryPeer`] to the [`MemoryListener`],
//! which plays the backend. Tests drive the peer; the client sees an ordinary
//! socket.

use super::{ABNORMAL_CLOSURE, Socket, SocketEvent, Transport};
use crate::TransportError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tether_core::WireMessage;
use tokio::sync::mpsc;

#[derive(Debug)]
enum ServerSignal {
    Frame(String),
    Close { code: u16, reason: String },
}

struct MemoryState {
    refusing: bool,
    rejecting_endpoints: bool,
    opened: usize,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// Client half: implements [`Transport`].
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

/// Server half: yields one [`MemoryPeer`] per opened socket.
pub struct MemoryListener {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = MemoryState {
            refusing: false,
            rejecting_endpoints: false,
            opened: 0,
            peers: tx,
        };
        (
            Self {
                state: Arc::new(Mutex::new(state)),
            },
            MemoryListener { peers: rx },
        )
    }

    /// While set, `open` fails as if the server were unreachable.
    pub fn set_refusing(&self, refusing: bool) {
        self.lock().refusing = refusing;
    }

    /// While set, `open` fails as if the URL could not be parsed.
    pub fn set_rejecting_endpoints(&self, rejecting: bool) {
        self.lock().rejecting_endpoints = rejecting;
    }

    /// Number of `open` calls so far, successful or not.
    pub fn open_count(&self) -> usize {
        self.lock().opened
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn Socket>, TransportError> {
        let mut state = self.lock();
        state.opened += 1;
        if state.rejecting_endpoints {
            return Err(TransportError::InvalidEndpoint {
                url: url.to_string(),
                reason: "rejected by memory transport".to_string(),
            });
        }
        if state.refusing {
            return Err(TransportError::Refused(url.to_string()));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            url: url.to_string(),
            inbound: from_client,
            outbound: to_client,
        };
        state
            .peers
            .send(peer)
            .map_err(|_| TransportError::Refused("listener dropped".to_string()))?;

        Ok(Box::new(MemorySocket {
            outbound: Some(to_server),
            inbound: from_server,
        }))
    }
}

struct MemorySocket {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: mpsc::UnboundedReceiver<ServerSignal>,
}

#[async_trait]
impl Socket for MemorySocket {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        outbound.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> SocketEvent {
        match self.inbound.recv().await {
            Some(ServerSignal::Frame(text)) => SocketEvent::Message(text),
            Some(ServerSignal::Close { code, reason }) => SocketEvent::Closed { code, reason },
            None => SocketEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: "peer dropped".to_string(),
            },
        }
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }
}

impl MemoryListener {
    /// Wait for the client to open the next socket.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.peers.try_recv().ok()
    }
}

/// Server side of one loopback socket.
pub struct MemoryPeer {
    url: String,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<ServerSignal>,
}

impl MemoryPeer {
    /// The URL the client opened.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next raw frame from the client; `None` once the client closed.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Next frame from the client that parses; unparseable frames are skipped.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        loop {
            let text = self.recv_text().await?;
            if let Ok(msg) = WireMessage::parse(&text) {
                return Some(msg);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<WireMessage> {
        while let Ok(text) = self.inbound.try_recv() {
            if let Ok(msg) = WireMessage::parse(&text) {
                return Some(msg);
            }
        }
        None
    }

    /// Deliver a raw frame. Returns false if the client socket is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outbound.send(ServerSignal::Frame(text.into())).is_ok()
    }

    pub fn send(&self, msg: &WireMessage) -> bool {
        match msg.to_text() {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Close the socket from the server side.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.outbound.send(ServerSignal::Close {
            code,
            reason: reason.into(),
        });
    }
}
