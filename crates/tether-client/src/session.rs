//! Conversation session.
//!
//! [`ConversationSession`] is the one object a UI holds per conversation. It
//! composes the connection manager, the offline queue, the ledger and the
//! recovery policy, and turns their activity into [`SessionEvent`]s.
//!
//! ```ignore
//! let session = SessionBuilder::new(session_id)
//!     .base_url("http://localhost:8000")
//!     .open()
//!     .await?;
//! session.send_message("hello").await?;
//! ```

use crate::backend::{HttpBackend, SessionBackend, websocket_url};
use crate::breaker::CircuitBreaker;
use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::connectivity::Connectivity;
use crate::ledger::{LedgerSnapshot, MessageLedger};
use crate::queue::{OfflineQueue, QueueEvent};
use crate::recovery::{
    ErrorCode, ErrorContext, FailureKind, FailureSignal, RecoveryDirective, RecoveryStrategy,
    classify,
};
use crate::store::{KeyValueStore, MemoryStore};
use crate::transport::{Transport, WsTransport};
use crate::ClientError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tether_core::{
    ChatMessage, ConnectionState, ErrorFrame, MAX_CONTENT_CHARS, MessageFormat, MessageFrame,
    Payload, QueuedMessage, Sender, SessionId, StreamFrame, WireMessage,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

/// Shown for pending messages found in the cache that no queue will deliver.
const NOT_DELIVERED: &str = "This message was not delivered.";

/// What a UI observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The ledger changed; re-read [`ConversationSession::messages`].
    MessagesChanged,
    StateChanged(ConnectionState),
    Typing(bool),
    /// A failure that needs the user's attention.
    Error(String),
}

/// Collects collaborators for a [`ConversationSession`].
pub struct SessionBuilder {
    session_id: SessionId,
    base_url: Option<String>,
    endpoint: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn KeyValueStore>>,
    connectivity: Option<Connectivity>,
    backend: Option<Arc<dyn SessionBackend>>,
    config: ClientConfig,
}

impl SessionBuilder {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            base_url: None,
            endpoint: None,
            transport: None,
            store: None,
            connectivity: None,
            backend: None,
            config: ClientConfig::default(),
        }
    }

    /// HTTP base of the backend. The socket endpoint and the REST backend are
    /// derived from it unless set explicitly.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Socket URL to use instead of the one derived from the base URL.
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn SessionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Load cached history, start fetching the server's history and make the
    /// first connection attempt. A failed attempt is not an error here: the
    /// connection manager keeps retrying and reports through state changes.
    pub async fn open(self) -> Result<ConversationSession, ClientError> {
        let endpoint = match (self.endpoint, self.base_url.as_deref()) {
            (Some(endpoint), _) => endpoint,
            (None, Some(base)) => websocket_url(base, &self.session_id)?,
            (None, None) => return Err(ClientError::NoEndpoint),
        };
        let backend = self.backend.or_else(|| {
            self.base_url
                .as_deref()
                .map(|base| Arc::new(HttpBackend::new(base)) as Arc<dyn SessionBackend>)
        });
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WsTransport) as Arc<dyn Transport>);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
        let connectivity = self.connectivity.unwrap_or_default();
        let config = self.config;
        let session_id = self.session_id;

        let mut ledger = MessageLedger::new(session_id.clone());
        match MessageLedger::load_cached(
            store.as_ref(),
            &session_id,
            config.ledger.cache_ttl(),
            Utc::now(),
        ) {
            Ok(cached) => {
                let count = ledger.merge(cached);
                tracing::debug!(session = %session_id, count, "loaded cached messages");
            }
            Err(e) => tracing::warn!(error = %e, "ignoring unreadable message cache"),
        }

        let queue = OfflineQueue::new(&session_id, config.queue.clone(), store.clone(), &connectivity);
        let stale: Vec<String> = ledger
            .pending()
            .filter(|m| m.sender == Sender::User && !queue.contains(&m.id))
            .map(|m| m.id.clone())
            .collect();
        for id in &stale {
            ledger.mark_error(id, NOT_DELIVERED);
        }

        let connection = ConnectionManager::new(transport, config.connection.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            recovery: Mutex::new(Recovery {
                breaker: CircuitBreaker::new(format!("session {session_id}"), config.breaker.clone()),
                context: ErrorContext::new(&config.errors),
                attempts: HashMap::new(),
            }),
            session_id,
            config,
            store,
            backend,
            connection,
            queue,
            ledger: Mutex::new(ledger),
            cache_version: AtomicU64::new(0),
            cache_written: Mutex::new(0),
            typing: AtomicBool::new(false),
            last_error: Mutex::new(None),
            events,
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&shared);
        shared.queue.set_sender(move |message| deliver_queued(weak.clone(), message));

        // Subscribe before connecting so no state change is missed.
        let connection_events = shared.connection.subscribe();
        let queue_events = shared.queue.subscribe();
        shared.spawn(pump_connection(shared.clone(), connection_events));
        shared.spawn(pump_queue(shared.clone(), queue_events));
        shared.spawn(fetch_history(shared.clone()));

        tracing::info!(session = %shared.session_id, endpoint = %endpoint, "opening session");
        if let Err(e) = shared.connection.connect(endpoint).await {
            tracing::warn!(error = %e, "first connection attempt failed");
        }

        Ok(ConversationSession { shared })
    }
}

/// One conversation with the agent.
pub struct ConversationSession {
    shared: Arc<Shared>,
}

struct Shared {
    session_id: SessionId,
    config: ClientConfig,
    store: Arc<dyn KeyValueStore>,
    backend: Option<Arc<dyn SessionBackend>>,
    connection: ConnectionManager,
    queue: OfflineQueue,
    ledger: Mutex<MessageLedger>,
    /// Bumped under the ledger lock for every snapshot taken.
    cache_version: AtomicU64,
    /// Version of the last snapshot written. Held while writing.
    cache_written: Mutex<u64>,
    typing: AtomicBool,
    last_error: Mutex<Option<String>>,
    recovery: Mutex<Recovery>,
    events: broadcast::Sender<SessionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Recovery {
    breaker: CircuitBreaker,
    context: ErrorContext,
    /// Automatic recoveries attempted per message id.
    attempts: HashMap<String, (FailureKind, u32)>,
}

enum RecoveryAction {
    Resend(String),
    Fallback(String),
}

impl ConversationSession {
    pub fn session_id(&self) -> &SessionId {
        &self.shared.session_id
    }

    /// Send a user message. Over the socket when connected, through the
    /// offline queue otherwise. Either way the message is in the ledger as
    /// `sending` when this returns.
    pub async fn send_message(&self, content: impl Into<String>) -> Result<ChatMessage, ClientError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let len = content.chars().count();
        if len > MAX_CONTENT_CHARS {
            return Err(ClientError::MessageTooLong {
                len,
                max: MAX_CONTENT_CHARS,
            });
        }

        let shared = &self.shared;
        if shared.connection.state().is_connected() {
            let message = ChatMessage::outgoing(shared.session_id.clone(), content);
            shared.update_ledger(true, |ledger| ledger.add(message.clone()));
            let frame = message_frame(&message.id, &message.content);
            if let Err(e) = shared.connection.send(frame).await {
                tracing::warn!(id = %message.id, error = %e, "send failed");
                shared.handle_failure(FailureSignal::Transport(e.to_string()), Some(&message.id));
            }
            Ok(message)
        } else {
            let queued = QueuedMessage::new(content, shared.session_id.clone());
            let mut message = ChatMessage::outgoing_with_id(
                queued.id.clone(),
                shared.session_id.clone(),
                queued.content.clone(),
            );
            message.timestamp = queued.timestamp;
            shared.update_ledger(true, |ledger| ledger.add(message.clone()));
            shared.queue.push(queued);
            tracing::info!(id = %message.id, state = %shared.connection.state(), "not connected, message queued");
            Ok(message)
        }
    }

    /// Sorted snapshot of the conversation.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.ledger().messages().to_vec()
    }

    /// A page of the conversation; see [`MessageLedger::window`].
    pub fn window(
        &self,
        before: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<ChatMessage> {
        self.shared.ledger().window(before, after, limit)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    pub fn is_typing(&self) -> bool {
        self.shared.typing.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Manual reconnect with a fresh attempt budget. Clears the last error
    /// and the failure history, closing the circuit breaker.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        lock(&self.shared.last_error).take();
        {
            let mut recovery = self.shared.recovery();
            recovery.breaker.reset();
            recovery.context.clear();
            recovery.attempts.clear();
        }
        self.shared.connection.reconnect().await
    }

    /// Flush the offline queue now, if connectivity allows.
    pub async fn process_queue(&self) {
        self.shared.queue.process_queue().await;
    }

    /// Stop everything this session started. Nothing fires after this returns.
    pub async fn close(&self) {
        let shared = &self.shared;
        shared.abort_tasks();
        shared.queue.close();
        shared.connection.shutdown().await;
        // A task may have been spawned while the connection shut down.
        shared.abort_tasks();
        shared.save_cache();
        shared.typing.store(false, Ordering::Release);
        tracing::info!(session = %shared.session_id, "session closed");
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.shared.abort_tasks();
        self.shared.queue.close();
    }
}

impl Shared {
    fn ledger(&self) -> MutexGuard<'_, MessageLedger> {
        lock(&self.ledger)
    }

    fn recovery(&self) -> MutexGuard<'_, Recovery> {
        lock(&self.recovery)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn abort_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    /// Mutate the ledger, keep it bounded, optionally persist, and tell observers.
    fn update_ledger<R>(&self, persist: bool, f: impl FnOnce(&mut MessageLedger) -> R) -> R {
        let (result, snapshot) = {
            let mut ledger = self.ledger();
            let result = f(&mut ledger);
            ledger.prune(self.config.ledger.max_messages);
            (result, persist.then(|| self.snapshot(&ledger)))
        };
        if let Some(snapshot) = snapshot {
            self.write_cache(snapshot);
        }
        self.emit(SessionEvent::MessagesChanged);
        result
    }

    fn snapshot(&self, ledger: &MessageLedger) -> (u64, LedgerSnapshot) {
        let version = self.cache_version.fetch_add(1, Ordering::AcqRel) + 1;
        (version, ledger.snapshot())
    }

    /// Runs without the ledger lock. A snapshot older than the one already
    /// written is skipped.
    fn write_cache(&self, (version, snapshot): (u64, LedgerSnapshot)) {
        let mut written = lock(&self.cache_written);
        if version <= *written {
            return;
        }
        match snapshot.save(self.store.as_ref()) {
            Ok(()) => *written = version,
            Err(e) => tracing::warn!(error = %e, "failed to cache messages"),
        }
    }

    fn save_cache(&self) {
        let snapshot = self.snapshot(&self.ledger());
        self.write_cache(snapshot);
    }

    fn set_typing(&self, typing: bool) {
        if self.typing.swap(typing, Ordering::AcqRel) != typing {
            self.emit(SessionEvent::Typing(typing));
        }
    }

    /// Content of a user message that is still waiting for delivery.
    fn pending_content(&self, id: &str) -> Option<String> {
        self.ledger()
            .get(id)
            .filter(|m| m.sender == Sender::User && m.is_pending())
            .map(|m| m.content.clone())
    }

    fn notify(&self, message: &str, related: Option<&str>) {
        if let Some(id) = related {
            self.update_ledger(true, |ledger| ledger.mark_error(id, message));
        }
        *lock(&self.last_error) = Some(message.to_string());
        self.emit(SessionEvent::Error(message.to_string()));
    }

    /// A message got through; reset the breaker and settle its failure record.
    fn recovered(&self, id: &str) {
        let mut recovery = self.recovery();
        recovery.breaker.record_success();
        if let Some((kind, _)) = recovery.attempts.remove(id) {
            recovery.context.mark_recovered(kind);
        }
    }

    /// Pick what to do about a failure, honouring the breaker, the recurrence
    /// check and the per-message retry budget.
    fn decide(&self, signal: &FailureSignal, related: Option<&str>) -> RecoveryDirective {
        let directive = classify(signal);
        let kind = signal.kind();
        let errors = &self.config.errors;
        let mut recovery = self.recovery();
        recovery.context.record(kind);
        recovery.breaker.record_failure();

        if directive.strategy == RecoveryStrategy::Notify {
            return directive;
        }
        let Some(id) = related else {
            return directive.into_notify();
        };
        if recovery
            .context
            .is_recurring(kind, errors.recurring_count, errors.recurring_window())
        {
            tracing::warn!(kind = ?kind, "failure keeps recurring, not retrying");
            return directive.into_notify();
        }
        let used = recovery.attempts.get(id).map_or(0, |(_, n)| *n);
        if directive.max_retries.is_some_and(|max| used >= max) {
            tracing::warn!(id, attempts = used, "out of automatic retries");
            return directive.into_notify();
        }
        if !recovery.breaker.can_attempt() {
            return RecoveryDirective::circuit_open();
        }
        recovery.attempts.insert(id.to_string(), (kind, used + 1));
        directive
    }

    fn handle_failure(self: &Arc<Self>, signal: FailureSignal, related: Option<&str>) {
        let pending = related
            .filter(|id| self.pending_content(id).is_some())
            .map(str::to_string);
        let directive = self.decide(&signal, pending.as_deref());
        let delay = directive.retry_delay.unwrap_or_default();
        match (directive.strategy, pending) {
            (RecoveryStrategy::Retry, Some(id)) => {
                tracing::info!(id = %id, delay_ms = delay.as_millis() as u64, "retrying message");
                self.schedule_recovery(delay, RecoveryAction::Resend(id));
            }
            (RecoveryStrategy::Fallback, Some(id)) => {
                tracing::info!(id = %id, delay_ms = delay.as_millis() as u64, "falling back to REST");
                self.schedule_recovery(delay, RecoveryAction::Fallback(id));
            }
            (_, pending) => self.notify(&directive.user_message, pending.as_deref()),
        }
    }

    fn schedule_recovery(self: &Arc<Self>, delay: Duration, action: RecoveryAction) {
        let shared = self.clone();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            match action {
                RecoveryAction::Resend(id) => shared.resend(id).await,
                RecoveryAction::Fallback(id) => shared.deliver_via_backend(id).await,
            }
        });
    }

    async fn resend(self: Arc<Self>, id: String) {
        let Some(content) = self.pending_content(&id) else {
            return;
        };
        if self.connection.state().is_connected() {
            match self.connection.send(message_frame(&id, &content)).await {
                Ok(()) => return,
                Err(e) => tracing::debug!(id = %id, error = %e, "resend failed, queueing"),
            }
        }
        if !self.queue.contains(&id) {
            let timestamp = self.ledger().get(&id).map_or_else(Utc::now, |m| m.timestamp);
            self.queue.push(QueuedMessage {
                id,
                content,
                session_id: self.session_id.clone(),
                timestamp,
                retry_count: 0,
            });
        }
    }

    async fn deliver_via_backend(self: Arc<Self>, id: String) {
        let Some(content) = self.pending_content(&id) else {
            return;
        };
        let Some(backend) = self.backend.clone() else {
            self.notify("The message could not be delivered.", Some(&id));
            return;
        };
        match backend.post_message(&self.session_id, &content).await {
            Ok(stored) => {
                let ack = MessageFrame {
                    message_id: stored.id,
                    content: stored.content,
                    format: stored.format,
                    sender: Some(Sender::User),
                    reply_to: Some(id.clone()),
                    metadata: None,
                };
                self.update_ledger(true, |ledger| ledger.acknowledge(&ack));
                self.recovered(&id);
            }
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "REST fallback failed");
                self.recovery().breaker.record_failure();
                self.notify("The message could not be delivered. Please try again.", Some(&id));
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, msg: WireMessage) {
        match msg.payload {
            Payload::ConnectionAck(ack) => {
                tracing::info!(session = %ack.session_id, version = ?ack.server_version, "connection acknowledged");
            }
            Payload::Message(frame) => self.handle_message(frame, msg.timestamp),
            Payload::Typing(frame) => self.set_typing(frame.is_typing),
            Payload::Stream(frame) => self.handle_stream(&frame, msg.timestamp),
            Payload::Error(frame) => self.handle_error_frame(&frame),
            Payload::Ping | Payload::Pong | Payload::Disconnect(_) => {}
        }
    }

    fn handle_message(&self, frame: MessageFrame, timestamp: DateTime<Utc>) {
        match frame.sender.unwrap_or(Sender::Agent) {
            Sender::User => {
                let acked = self.update_ledger(true, |ledger| {
                    let acked = ledger.acknowledge(&frame);
                    if acked.is_none() && !ledger.contains(&frame.message_id) {
                        // Sent from another client of the same session.
                        ledger.add(ChatMessage::received(
                            frame.message_id.clone(),
                            self.session_id.clone(),
                            Sender::User,
                            frame.content.clone(),
                            frame.format,
                            timestamp,
                        ));
                    }
                    acked
                });
                if let Some(id) = acked {
                    tracing::debug!(id = %id, "message acknowledged");
                    self.recovered(&id);
                }
            }
            Sender::Agent => {
                let reply_to = frame.reply_to.clone();
                let mut message = ChatMessage::received(
                    frame.message_id,
                    self.session_id.clone(),
                    Sender::Agent,
                    frame.content,
                    frame.format,
                    timestamp,
                );
                if let Some(metadata) = frame.metadata {
                    message.metadata = metadata;
                }
                let acked = self.update_ledger(true, |ledger| {
                    let acked = reply_to.as_deref().filter(|id| ack_user_message(ledger, id));
                    ledger.add(message);
                    acked.map(str::to_string)
                });
                if let Some(id) = acked {
                    self.recovered(&id);
                }
                self.set_typing(false);
            }
        }
    }

    fn handle_stream(&self, frame: &StreamFrame, timestamp: DateTime<Utc>) {
        let acked = self.update_ledger(frame.is_complete, |ledger| {
            let acked = Some(frame.reply_to.as_str())
                .filter(|id| !id.is_empty() && ack_user_message(ledger, id));
            ledger.apply_chunk(frame, timestamp);
            acked.map(str::to_string)
        });
        if let Some(id) = acked {
            self.recovered(&id);
        }
        if frame.is_complete {
            self.set_typing(false);
        }
    }

    fn handle_error_frame(self: &Arc<Self>, frame: &ErrorFrame) {
        tracing::warn!(
            code = %frame.code,
            message = %frame.message,
            related = ?frame.related_message_id,
            "backend reported an error"
        );
        self.set_typing(false);
        let code = ErrorCode::from_wire(&frame.code);
        self.handle_failure(FailureSignal::Backend(code), frame.related_message_id.as_deref());
    }

    fn handle_state(self: &Arc<Self>, state: ConnectionState) {
        self.emit(SessionEvent::StateChanged(state));
        if state.is_connected() {
            let shared = self.clone();
            self.spawn(async move { shared.queue.process_queue().await });
        } else {
            self.set_typing(false);
        }
    }
}

/// Mark a pending user message sent because the agent answered it.
fn ack_user_message(ledger: &mut MessageLedger, id: &str) -> bool {
    let is_user = ledger.get(id).is_some_and(|m| m.sender == Sender::User);
    is_user && ledger.mark_sent(id)
}

fn message_frame(id: &str, content: &str) -> WireMessage {
    WireMessage::now(Payload::Message(MessageFrame {
        message_id: id.to_string(),
        content: content.to_string(),
        format: MessageFormat::Plain,
        sender: Some(Sender::User),
        reply_to: None,
        metadata: None,
    }))
}

async fn deliver_queued(shared: Weak<Shared>, message: QueuedMessage) -> Result<(), ClientError> {
    let shared = shared.upgrade().ok_or(ClientError::Shutdown)?;
    shared
        .connection
        .send(message_frame(&message.id, &message.content))
        .await
}

async fn pump_connection(shared: Arc<Shared>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Frame(msg)) => shared.handle_frame(msg),
            Ok(ConnectionEvent::StateChanged(state)) => shared.handle_state(state),
            Ok(ConnectionEvent::TransportError(e)) => {
                tracing::debug!(error = %e, "transport error");
                shared.recovery().context.record(FailureKind::Transport);
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "session fell behind connection events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn pump_queue(shared: Arc<Shared>, mut events: broadcast::Receiver<QueueEvent>) {
    loop {
        match events.recv().await {
            Ok(QueueEvent::Sent { id }) => {
                shared.update_ledger(true, |ledger| ledger.mark_sent(&id));
                shared.recovered(&id);
            }
            Ok(QueueEvent::Dropped { id, reason }) => shared.notify(&reason, Some(&id)),
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "session fell behind queue events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn fetch_history(shared: Arc<Shared>) {
    let Some(backend) = shared.backend.clone() else {
        return;
    };
    match backend.fetch_history(&shared.session_id).await {
        Ok(history) => {
            let added = shared.update_ledger(true, |ledger| ledger.merge(history));
            tracing::info!(session = %shared.session_id, added, "history merged");
        }
        Err(e) => tracing::warn!(error = %e, "could not fetch history, showing cached messages"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
