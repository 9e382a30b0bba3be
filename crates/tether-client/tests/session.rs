use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_client::ledger::MessageLedger;
use tether_client::transport::{MemoryListener, MemoryPeer, MemoryTransport};
use tether_client::{
    BackendError, ChatMessage, ClientConfig, ClientError, ConnectionState, Connectivity, ConversationSession,
    ErrorFrame, KeyValueStore, MemoryStore, MessageFormat, MessageFrame, MessageStatus, Payload,
    Sender, SessionBackend, SessionBuilder, SessionEvent, SessionId, StreamFrame, TypingFrame,
    WireMessage,
};

fn sid() -> SessionId {
    "session-1".parse().unwrap()
}

struct Harness {
    session: ConversationSession,
    transport: MemoryTransport,
    listener: MemoryListener,
}

async fn open_with(
    store: Arc<dyn KeyValueStore>,
    connectivity: Connectivity,
    backend: Option<Arc<dyn SessionBackend>>,
    refusing: bool,
) -> Harness {
    open_configured(store, connectivity, backend, refusing, ClientConfig::default()).await
}

async fn open_configured(
    store: Arc<dyn KeyValueStore>,
    connectivity: Connectivity,
    backend: Option<Arc<dyn SessionBackend>>,
    refusing: bool,
    config: ClientConfig,
) -> Harness {
    let (transport, listener) = MemoryTransport::new();
    transport.set_refusing(refusing);
    let mut builder = SessionBuilder::new(sid())
        .endpoint("ws://test/api/v1/sessions/ws/session-1")
        .transport(Arc::new(transport.clone()))
        .store(store)
        .connectivity(connectivity)
        .config(config);
    if let Some(backend) = backend {
        builder = builder.backend(backend);
    }
    let session = builder.open().await.unwrap();
    Harness {
        session,
        transport,
        listener,
    }
}

async fn open() -> (ConversationSession, MemoryPeer) {
    let mut h = open_with(
        Arc::new(MemoryStore::new()),
        Connectivity::online(),
        None,
        false,
    )
    .await;
    let peer = h.listener.accept().await.unwrap();
    (h.session, peer)
}

/// Poll until `cond` holds, letting paused time advance in small steps.
async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Next user message the client wrote, skipping heartbeats.
async fn next_message(peer: &mut MemoryPeer) -> MessageFrame {
    loop {
        let msg = peer.recv().await.expect("client closed the socket");
        if let Payload::Message(frame) = msg.payload {
            return frame;
        }
    }
}

/// Assert the client wrote no user message since the last read.
fn assert_no_message(peer: &mut MemoryPeer) {
    while let Some(msg) = peer.try_recv() {
        assert!(
            !matches!(msg.payload, Payload::Message(_)),
            "unexpected message {msg:?}"
        );
    }
}

fn error_of(session: &ConversationSession, id: &str) -> Option<String> {
    session
        .messages()
        .into_iter()
        .find(|m| m.id == id)
        .and_then(|m| m.error_message().map(str::to_string))
}

fn ack(frame: &MessageFrame) -> WireMessage {
    WireMessage::now(Payload::Message(MessageFrame {
        sender: Some(Sender::User),
        ..frame.clone()
    }))
}

fn error_frame(code: &str, related: &str) -> WireMessage {
    WireMessage::now(Payload::Error(ErrorFrame {
        code: code.into(),
        message: "backend detail".into(),
        related_message_id: Some(related.into()),
        retryable: false,
    }))
}

fn status_of(session: &ConversationSession, id: &str) -> Option<MessageStatus> {
    session
        .messages()
        .into_iter()
        .find(|m| m.id == id)
        .map(|m| m.status)
}

#[derive(Default)]
struct FakeBackend {
    history: Vec<ChatMessage>,
    posted: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionBackend for FakeBackend {
    async fn fetch_history(&self, _: &SessionId) -> Result<Vec<ChatMessage>, BackendError> {
        Ok(self.history.clone())
    }

    async fn post_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> Result<ChatMessage, BackendError> {
        self.posted.lock().unwrap().push(content.to_string());
        Ok(ChatMessage::received(
            "srv-9",
            session_id.clone(),
            Sender::User,
            content,
            MessageFormat::Plain,
            chrono::Utc::now(),
        ))
    }
}

#[tokio::test(start_paused = true)]
async fn clean_send_is_acknowledged() {
    let (session, mut peer) = open().await;
    assert_eq!(session.connection_state(), ConnectionState::Connected);

    let sent = session.send_message("hi").await.unwrap();
    let messages = session.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Sending);

    let frame = next_message(&mut peer).await;
    assert_eq!(frame.message_id, sent.id);
    assert_eq!(frame.content, "hi");
    peer.send(&ack(&frame));

    wait_until("ack", || status_of(&session, &sent.id) == Some(MessageStatus::Sent)).await;
    let messages = session.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hi");
}

#[tokio::test(start_paused = true)]
async fn agent_reply_acknowledges_and_is_added() {
    let (session, mut peer) = open().await;
    let sent = session.send_message("ping?").await.unwrap();
    let frame = next_message(&mut peer).await;

    peer.send(&WireMessage::now(Payload::Typing(TypingFrame { is_typing: true })));
    wait_until("typing", || session.is_typing()).await;

    peer.send(&WireMessage::now(Payload::Message(MessageFrame {
        message_id: "agent-1".into(),
        content: "pong!".into(),
        format: MessageFormat::Markdown,
        sender: Some(Sender::Agent),
        reply_to: Some(frame.message_id.clone()),
        metadata: None,
    })));

    wait_until("reply", || session.messages().len() == 2).await;
    assert_eq!(status_of(&session, &sent.id), Some(MessageStatus::Sent));
    let reply = session.messages().pop().unwrap();
    assert_eq!(reply.sender, Sender::Agent);
    assert_eq!(reply.format, MessageFormat::Markdown);
    assert!(!session.is_typing());
}

#[tokio::test(start_paused = true)]
async fn streamed_reply_builds_one_message() {
    let (session, peer) = open().await;
    for (chunk, done) in [("Hel", false), ("lo", false), (" there", true)] {
        peer.send(&WireMessage::now(Payload::Stream(StreamFrame {
            message_id: "agent-7".into(),
            reply_to: String::new(),
            chunk: chunk.into(),
            is_complete: done,
            format: None,
        })));
    }
    wait_until("stream", || {
        session
            .messages()
            .first()
            .is_some_and(|m| m.status == MessageStatus::Sent)
    })
    .await;
    let messages = session.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Hello there");
}

#[tokio::test(start_paused = true)]
async fn offline_send_then_reconnect_drains_queue() {
    let connectivity = Connectivity::new(true);
    let mut h = open_with(
        Arc::new(MemoryStore::new()),
        connectivity.clone(),
        None,
        true,
    )
    .await;
    assert_eq!(h.session.connection_state(), ConnectionState::Reconnecting);

    let sent = h.session.send_message("hello").await.unwrap();
    assert_eq!(status_of(&h.session, &sent.id), Some(MessageStatus::Sending));
    assert_eq!(h.session.queue_len(), 1);

    h.transport.set_refusing(false);
    let mut peer = h.listener.accept().await.unwrap();
    wait_until("connected", || h.session.connection_state().is_connected()).await;
    // Still flagged offline, so nothing is flushed yet.
    assert_eq!(h.session.queue_len(), 1);

    connectivity.set_offline(false);
    let frame = next_message(&mut peer).await;
    assert_eq!(frame.message_id, sent.id);
    assert_eq!(frame.content, "hello");

    let session = &h.session;
    wait_until("drained", || session.queue_len() == 0).await;
    wait_until("sent", || status_of(session, &sent.id) == Some(MessageStatus::Sent)).await;
}

#[tokio::test(start_paused = true)]
async fn rejects_invalid_content() {
    let (session, _peer) = open().await;
    assert!(matches!(
        session.send_message("   ").await,
        Err(ClientError::EmptyMessage)
    ));
    let long = "x".repeat(10_001);
    assert!(matches!(
        session.send_message(long).await,
        Err(ClientError::MessageTooLong { len: 10_001, max: 10_000 })
    ));
    assert!(session.send_message("x".repeat(10_000)).await.is_ok());
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn notify_error_marks_message_and_reconnect_clears_it() {
    let (session, mut peer) = open().await;
    let mut events = session.subscribe();
    let sent = session.send_message("secret").await.unwrap();
    next_message(&mut peer).await;

    peer.send(&error_frame("AUTHENTICATION_FAILED", &sent.id));
    wait_until("error", || status_of(&session, &sent.id) == Some(MessageStatus::Error)).await;

    let message = session
        .messages()
        .into_iter()
        .find(|m| m.id == sent.id)
        .unwrap();
    let expected = "Authentication failed. Please sign in again.";
    assert_eq!(message.error_message(), Some(expected));
    assert_eq!(session.last_error().as_deref(), Some(expected));

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        saw_error |= event == SessionEvent::Error(expected.to_string());
    }
    assert!(saw_error);

    session.reconnect().await.unwrap();
    assert_eq!(session.last_error(), None);
}

#[tokio::test(start_paused = true)]
async fn retryable_error_resends_same_message() {
    let (session, mut peer) = open().await;
    let sent = session.send_message("slow one").await.unwrap();
    next_message(&mut peer).await;

    peer.send(&error_frame("AGENT_TIMEOUT", &sent.id));
    let again = next_message(&mut peer).await;
    assert_eq!(again.message_id, sent.id);

    peer.send(&ack(&again));
    wait_until("ack", || status_of(&session, &sent.id) == Some(MessageStatus::Sent)).await;
    assert_eq!(session.last_error(), None);
}

#[tokio::test(start_paused = true)]
async fn unavailable_agent_falls_back_to_rest() {
    let backend = Arc::new(FakeBackend::default());
    let mut h = open_with(
        Arc::new(MemoryStore::new()),
        Connectivity::online(),
        Some(backend.clone()),
        false,
    )
    .await;
    let mut peer = h.listener.accept().await.unwrap();
    let session = &h.session;
    let sent = session.send_message("anyone there?").await.unwrap();
    next_message(&mut peer).await;

    peer.send(&error_frame("AGENT_UNAVAILABLE", &sent.id));
    wait_until("fallback", || status_of(session, &sent.id) == Some(MessageStatus::Sent)).await;

    assert_eq!(*backend.posted.lock().unwrap(), vec!["anyone there?".to_string()]);
    let message = session
        .messages()
        .into_iter()
        .find(|m| m.id == sent.id)
        .unwrap();
    assert_eq!(
        message.metadata.get("serverId").and_then(|v| v.as_str()),
        Some("srv-9")
    );
}

#[tokio::test(start_paused = true)]
async fn cached_and_fetched_history_are_merged() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let t0 = chrono::Utc::now() - chrono::Duration::minutes(10);

    let mut cached = MessageLedger::new(sid());
    cached.add(ChatMessage::received(
        "m1",
        sid(),
        Sender::User,
        "earlier",
        MessageFormat::Plain,
        t0,
    ));
    let mut stuck = ChatMessage::outgoing_with_id("m-stuck", sid(), "never sent");
    stuck.timestamp = t0 + chrono::Duration::seconds(1);
    cached.add(stuck);
    cached.save(store.as_ref()).unwrap();

    let backend = Arc::new(FakeBackend {
        history: vec![
            ChatMessage::received("m1", sid(), Sender::User, "earlier", MessageFormat::Plain, t0),
            ChatMessage::received(
                "m2",
                sid(),
                Sender::Agent,
                "reply",
                MessageFormat::Plain,
                t0 + chrono::Duration::seconds(2),
            ),
        ],
        ..FakeBackend::default()
    });
    let h = open_with(store, Connectivity::online(), Some(backend), false).await;
    let session = &h.session;

    wait_until("history", || session.messages().len() == 3).await;
    let messages = session.messages();
    let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m-stuck", "m2"]);
    assert_eq!(messages[1].status, MessageStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn close_stops_reconnecting() {
    let h = open_with(
        Arc::new(MemoryStore::new()),
        Connectivity::online(),
        None,
        true,
    )
    .await;
    assert_eq!(h.session.connection_state(), ConnectionState::Reconnecting);
    let opens = h.transport.open_count();

    h.session.close().await;
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.transport.open_count(), opens);
}

#[tokio::test(start_paused = true)]
async fn connectivity_returning_before_the_socket_keeps_the_message() {
    let connectivity = Connectivity::new(true);
    let mut h = open_with(
        Arc::new(MemoryStore::new()),
        connectivity.clone(),
        None,
        true,
    )
    .await;
    let sent = h.session.send_message("hello").await.unwrap();

    // Online again, but the socket stays down through several queue retries.
    connectivity.set_offline(false);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.session.connection_state(), ConnectionState::Reconnecting);
    assert!(h.listener.try_accept().is_none());
    assert_eq!(h.session.queue_len(), 1);
    assert_eq!(status_of(&h.session, &sent.id), Some(MessageStatus::Sending));
    assert_eq!(h.session.last_error(), None);

    h.transport.set_refusing(false);
    let mut peer = h.listener.accept().await.unwrap();
    let frame = next_message(&mut peer).await;
    assert_eq!(frame.message_id, sent.id);

    let session = &h.session;
    wait_until("sent", || status_of(session, &sent.id) == Some(MessageStatus::Sent)).await;
    assert_eq!(session.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn recurring_failure_stops_automatic_retries() {
    let (session, mut peer) = open().await;
    let expected = "The server hit an unexpected error. Retrying.";

    // Two messages recover through a resend.
    for content in ["one", "two"] {
        let sent = session.send_message(content).await.unwrap();
        next_message(&mut peer).await;
        peer.send(&error_frame("INTERNAL_ERROR", &sent.id));
        let again = next_message(&mut peer).await;
        assert_eq!(again.message_id, sent.id);
        peer.send(&ack(&again));
        wait_until("ack", || status_of(&session, &sent.id) == Some(MessageStatus::Sent)).await;
    }

    // The third occurrence within the window is not retried.
    let sent = session.send_message("three").await.unwrap();
    next_message(&mut peer).await;
    peer.send(&error_frame("INTERNAL_ERROR", &sent.id));
    wait_until("error", || status_of(&session, &sent.id) == Some(MessageStatus::Error)).await;
    assert_eq!(error_of(&session, &sent.id).as_deref(), Some(expected));
    assert_eq!(session.last_error().as_deref(), Some(expected));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_no_message(&mut peer);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_runs_out_per_message() {
    let mut config = ClientConfig::default();
    config.errors.recurring_count = 10;
    let mut h = open_configured(
        Arc::new(MemoryStore::new()),
        Connectivity::online(),
        None,
        false,
        config,
    )
    .await;
    let mut peer = h.listener.accept().await.unwrap();
    let session = &h.session;
    let sent = session.send_message("slow").await.unwrap();
    next_message(&mut peer).await;

    // AGENT_TIMEOUT allows two resends.
    for _ in 0..2 {
        peer.send(&error_frame("AGENT_TIMEOUT", &sent.id));
        let again = next_message(&mut peer).await;
        assert_eq!(again.message_id, sent.id);
    }
    peer.send(&error_frame("AGENT_TIMEOUT", &sent.id));
    wait_until("error", || status_of(session, &sent.id) == Some(MessageStatus::Error)).await;
    let expected = "The agent took too long to respond. Retrying.";
    assert_eq!(session.last_error().as_deref(), Some(expected));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_no_message(&mut peer);
}

#[tokio::test(start_paused = true)]
async fn open_circuit_refuses_retries_until_reconnect() {
    let mut config = ClientConfig::default();
    config.errors.recurring_count = 100;
    config.breaker.failure_threshold = 2;
    let mut h = open_configured(
        Arc::new(MemoryStore::new()),
        Connectivity::online(),
        None,
        false,
        config,
    )
    .await;
    let mut peer = h.listener.accept().await.unwrap();
    let sent = h.session.send_message("first").await.unwrap();
    next_message(&mut peer).await;

    peer.send(&error_frame("AGENT_TIMEOUT", &sent.id));
    next_message(&mut peer).await;
    peer.send(&error_frame("AGENT_TIMEOUT", &sent.id));

    let expected = "Too many failures. Please try again later.";
    let session = &h.session;
    wait_until("circuit", || status_of(session, &sent.id) == Some(MessageStatus::Error)).await;
    assert_eq!(error_of(session, &sent.id).as_deref(), Some(expected));
    assert_eq!(session.last_error().as_deref(), Some(expected));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_no_message(&mut peer);

    // A manual reconnect starts from a closed breaker.
    assert!(h.listener.try_accept().is_none());
    h.session.reconnect().await.unwrap();
    let mut peer = h.listener.accept().await.unwrap();
    let session = &h.session;
    wait_until("connected", || session.connection_state().is_connected()).await;
    let sent = session.send_message("second").await.unwrap();
    next_message(&mut peer).await;
    peer.send(&error_frame("AGENT_TIMEOUT", &sent.id));
    let again = next_message(&mut peer).await;
    assert_eq!(again.message_id, sent.id);
}
