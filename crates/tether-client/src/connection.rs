//! Connection manager.
//!
//! One task owns the socket and everything time-driven about it. The rest of
//! the client talks to that task through [`ConnectionManager`]: commands go in
//! over an mpsc channel, events come out over a broadcast channel, and the
//! current [`ConnectionState`] is published on a watch channel.
//!
//! Each phase of the state machine owns at most one timer (the heartbeat
//! interval while connected, the backoff sleep while reconnecting). Timers live
//! inside the [`Phase`] value, so replacing the phase is what cancels them.

use crate::config::ConnectionConfig;
use crate::transport::{Socket, SocketEvent, Transport};
use crate::{ClientError, TransportError};
use futures_util::future::BoxFuture;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tether_core::{ConnectionState, Payload, WireMessage};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

const EVENT_CAPACITY: usize = 256;

/// Something observers of the connection may care about.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A parsed frame from the server.
    Frame(WireMessage),
    StateChanged(ConnectionState),
    TransportError(TransportError),
}

enum Command {
    Connect {
        endpoint: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Send {
        frame: WireMessage,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the connection task.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Spawn the connection task. Must be called inside a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let driver = Driver {
            transport,
            config,
            commands: commands_rx,
            state: state_tx,
            events: events.clone(),
            phase: Phase::Idle,
            endpoint: None,
            attempts: 0,
            pending_connect: None,
        };
        let task = tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            events,
            task: Mutex::new(Some(task)),
        }
    }

    /// Register an observer. Dropping the receiver unregisters it.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Open a connection to `endpoint`. Resolves once the first attempt settles;
    /// if it failed, the manager keeps retrying in the background unless the
    /// endpoint itself was unusable.
    pub async fn connect(&self, endpoint: impl Into<String>) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect {
            endpoint: endpoint.into(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Write one frame. Fails with [`ClientError::NotConnected`] unless connected.
    pub async fn send(&self, frame: WireMessage) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { frame, reply })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Close the connection and cancel any pending reconnect.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Start over with a fresh attempt budget, from any state.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Reconnect { reply })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Close the socket, cancel every timer and stop the task. No event is
    /// emitted after this returns.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    fn command(&self, cmd: Command) -> Result<(), ClientError> {
        self.commands.send(cmd).map_err(|_| ClientError::Shutdown)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

enum Phase {
    Idle,
    Connecting(BoxFuture<'static, Result<Box<dyn Socket>, TransportError>>),
    Connected(Link),
    Backoff(Pin<Box<Sleep>>),
    Failed,
}

struct Link {
    socket: Box<dyn Socket>,
    heartbeat: Interval,
    last_inbound: Instant,
}

enum PhaseEvent {
    Opened(Result<Box<dyn Socket>, TransportError>),
    Socket(SocketEvent),
    Heartbeat,
    BackoffElapsed,
}

/// Wait for whatever the current phase is waiting for. Cancel-safe: the
/// futures polled here are owned by the phase, not by this call.
async fn next_event(phase: &mut Phase) -> PhaseEvent {
    match phase {
        Phase::Connecting(open) => PhaseEvent::Opened(open.as_mut().await),
        Phase::Connected(link) => tokio::select! {
            _ = link.heartbeat.tick() => PhaseEvent::Heartbeat,
            event = link.socket.recv() => PhaseEvent::Socket(event),
        },
        Phase::Backoff(sleep) => {
            sleep.as_mut().await;
            PhaseEvent::BackoffElapsed
        }
        Phase::Idle | Phase::Failed => std::future::pending().await,
    }
}

struct Driver {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    phase: Phase,
    endpoint: Option<String>,
    attempts: u32,
    pending_connect: Option<oneshot::Sender<Result<(), ClientError>>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                event = next_event(&mut self.phase) => self.handle_event(event).await,
            }
        }
        tracing::debug!("connection task stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { endpoint, reply } => {
                if matches!(self.phase, Phase::Connected(_))
                    && self.endpoint.as_deref() == Some(endpoint.as_str())
                {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.cancel_pending_connect();
                self.leave_phase().await;
                self.endpoint = Some(endpoint);
                self.attempts = 0;
                self.pending_connect = Some(reply);
                self.begin_connect();
            }
            Command::Send { frame, reply } => {
                let result = self.write(&frame).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
            Command::Reconnect { reply } => {
                if self.endpoint.is_none() {
                    let _ = reply.send(Err(ClientError::NoEndpoint));
                    return;
                }
                tracing::info!("manual reconnect");
                self.leave_phase().await;
                self.attempts = 0;
                self.begin_connect();
                let _ = reply.send(Ok(()));
            }
            // Handled by `run` so that it can break out of the loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_event(&mut self, event: PhaseEvent) {
        match event {
            PhaseEvent::Opened(Ok(socket)) => {
                let interval = self.config.heartbeat_interval();
                let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.phase = Phase::Connected(Link {
                    socket,
                    heartbeat,
                    last_inbound: Instant::now(),
                });
                self.attempts = 0;
                self.set_state(ConnectionState::Connected);
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            PhaseEvent::Opened(Err(err)) => {
                tracing::warn!(error = %err, attempt = self.attempts, "connection attempt failed");
                self.emit(ConnectionEvent::TransportError(err.clone()));
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Err(err.clone().into()));
                }
                if err.is_construction() {
                    tracing::error!(error = %err, "endpoint unusable, not retrying");
                    self.phase = Phase::Failed;
                    self.set_state(ConnectionState::Failed);
                } else {
                    self.phase = Phase::Idle;
                    self.schedule_retry();
                }
            }
            PhaseEvent::Socket(SocketEvent::Message(text)) => self.handle_frame(&text).await,
            PhaseEvent::Socket(SocketEvent::Closed { code, reason }) => {
                tracing::info!(code, reason = %reason, "socket closed by remote");
                // The socket is already gone; drop it without a close handshake.
                self.phase = Phase::Idle;
                self.schedule_retry();
            }
            PhaseEvent::Socket(SocketEvent::Error(message)) => {
                tracing::warn!(error = %message, "socket error");
                self.emit(ConnectionEvent::TransportError(TransportError::Io(message)));
                self.connection_lost().await;
            }
            PhaseEvent::Heartbeat => self.heartbeat().await,
            PhaseEvent::BackoffElapsed => self.begin_connect(),
        }
    }

    async fn handle_frame(&mut self, text: &str) {
        if let Phase::Connected(link) = &mut self.phase {
            link.last_inbound = Instant::now();
        }

        let msg = match WireMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) if e.is_unknown_type() => {
                tracing::debug!(error = %e, "ignoring frame");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        match &msg.payload {
            Payload::Ping => {
                if let Err(e) = self.write(&WireMessage::pong()).await {
                    tracing::debug!(error = %e, "could not answer ping");
                }
                self.emit(ConnectionEvent::Frame(msg));
            }
            Payload::Disconnect(frame) => {
                tracing::info!(code = frame.code, reason = %frame.reason, "server requested disconnect");
                self.emit(ConnectionEvent::Frame(msg));
                self.connection_lost().await;
            }
            _ => self.emit(ConnectionEvent::Frame(msg)),
        }
    }

    async fn heartbeat(&mut self) {
        let silence = match &self.phase {
            Phase::Connected(link) => link.last_inbound.elapsed(),
            _ => return,
        };
        if let Some(timeout) = self.config.pong_timeout() {
            if silence > self.config.heartbeat_interval() + timeout {
                tracing::warn!(silence_ms = silence.as_millis() as u64, "heartbeat timed out");
                self.connection_lost().await;
                return;
            }
        }
        tracing::trace!("ping");
        if let Err(e) = self.write(&WireMessage::ping()).await {
            tracing::debug!(error = %e, "heartbeat write failed");
        }
    }

    /// Write a frame; a failed write counts as losing the connection.
    async fn write(&mut self, frame: &WireMessage) -> Result<(), ClientError> {
        let Phase::Connected(link) = &mut self.phase else {
            return Err(ClientError::NotConnected);
        };
        let text = frame.to_text()?;
        match link.socket.send(text).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %err, "socket write failed");
                self.emit(ConnectionEvent::TransportError(err.clone()));
                self.connection_lost().await;
                Err(err.into())
            }
        }
    }

    fn begin_connect(&mut self) {
        let Some(url) = self.endpoint.clone() else {
            self.phase = Phase::Idle;
            self.set_state(ConnectionState::Disconnected);
            return;
        };
        tracing::debug!(url = %url, "opening socket");
        let transport = self.transport.clone();
        self.phase = Phase::Connecting(Box::pin(async move { transport.open(&url).await }));
        self.set_state(ConnectionState::Connecting);
    }

    /// Tear down the current socket, if any, and retry with backoff.
    async fn connection_lost(&mut self) {
        self.leave_phase().await;
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        self.attempts += 1;
        if self.attempts > self.config.max_attempts {
            tracing::error!(attempts = self.attempts - 1, "giving up on reconnecting");
            self.phase = Phase::Failed;
            self.set_state(ConnectionState::Failed);
            return;
        }
        let delay = self.config.backoff_delay(self.attempts);
        tracing::info!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnecting after backoff"
        );
        self.phase = Phase::Backoff(Box::pin(tokio::time::sleep(delay)));
        self.set_state(ConnectionState::Reconnecting);
    }

    /// Drop the current phase and its timer, closing the socket if one is open.
    async fn leave_phase(&mut self) {
        if let Phase::Connected(mut link) = std::mem::replace(&mut self.phase, Phase::Idle) {
            link.socket.close().await;
        }
    }

    async fn teardown(&mut self) {
        self.leave_phase().await;
        self.cancel_pending_connect();
        self.set_state(ConnectionState::Disconnected);
    }

    fn cancel_pending_connect(&mut self) {
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(ClientError::Cancelled));
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if *self.state.borrow() == next {
            return;
        }
        tracing::info!(state = %next, "connection state changed");
        self.state.send_replace(next);
        self.emit(ConnectionEvent::StateChanged(next));
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}
