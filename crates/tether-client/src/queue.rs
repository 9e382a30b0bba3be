//! Offline outbound queue.
//!
//! Messages composed while there is no connection wait here. The queue does
//! not know how to deliver anything; the session configures it once with a
//! send function. A pass over the queue runs when asked, when connectivity
//! comes back, and on a fixed retry delay while failed entries remain.
//!
//! A send that fails with [`ClientError::NotConnected`] pauses the pass
//! instead of counting against the message: the transport is offline as far
//! as the queue is concerned.

use crate::ClientError;
use crate::config::QueueConfig;
use crate::connectivity::Connectivity;
use crate::store::{KeyValueStore, get_json, set_json};
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tether_core::{QueuedMessage, SessionId};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

/// Delivers one queued message.
pub type SendFn =
    Arc<dyn Fn(QueuedMessage) -> BoxFuture<'static, Result<(), ClientError>> + Send + Sync>;

/// Outcome of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Sent { id: String },
    /// Evicted by the size bound or out of retries. It will not come back.
    Dropped { id: String, reason: String },
}

pub struct OfflineQueue {
    inner: Arc<Inner>,
}

struct Inner {
    key: String,
    config: QueueConfig,
    store: Arc<dyn KeyValueStore>,
    offline: watch::Receiver<bool>,
    entries: Mutex<VecDeque<QueuedMessage>>,
    processing: AtomicBool,
    closed: AtomicBool,
    sender: OnceLock<SendFn>,
    retry: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<QueueEvent>,
}

pub fn queue_key(session_id: &SessionId) -> String {
    format!("tether:queue:{session_id}")
}

impl OfflineQueue {
    /// Restore any persisted entries for `session_id` and start listening to
    /// `connectivity`. Must be called inside a tokio runtime.
    pub fn new(
        session_id: &SessionId,
        config: QueueConfig,
        store: Arc<dyn KeyValueStore>,
        connectivity: &Connectivity,
    ) -> Self {
        let key = queue_key(session_id);
        let restored = match get_json::<VecDeque<QueuedMessage>>(store.as_ref(), &key) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "discarding unreadable offline queue");
                VecDeque::new()
            }
        };
        if !restored.is_empty() {
            tracing::info!(session = %session_id, count = restored.len(), "restored offline queue");
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            key,
            config,
            store,
            offline: connectivity.subscribe(),
            entries: Mutex::new(restored),
            processing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sender: OnceLock::new(),
            retry: Mutex::new(None),
            watcher: Mutex::new(None),
            events,
        });

        // Read the starting value here, not on the watcher's first poll, so a
        // change made before that poll is still seen as a change.
        let mut offline = connectivity.subscribe();
        let started_offline = *offline.borrow_and_update();
        let watcher = tokio::spawn(watch_connectivity(
            Arc::downgrade(&inner),
            offline,
            started_offline,
        ));
        *lock(&inner.watcher) = Some(watcher);

        Self { inner }
    }

    /// Configure delivery. Only the first call takes effect; returns whether
    /// this one did.
    pub fn set_sender<F, Fut>(&self, send: F) -> bool
    where
        F: Fn(QueuedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        let send: SendFn = Arc::new(move |message| Box::pin(send(message)));
        self.inner.sender.set(send).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Append a message, evicting the oldest entry when full. Never blocks.
    pub fn enqueue(&self, content: impl Into<String>, session_id: SessionId) -> QueuedMessage {
        let message = QueuedMessage::new(content, session_id);
        self.push(message.clone());
        message
    }

    /// Append an already built message, e.g. one whose id the ledger knows.
    pub fn push(&self, message: QueuedMessage) {
        let evicted = {
            let mut entries = self.inner.entries();
            let evicted = evict_to(&mut entries, self.inner.config.max_size.saturating_sub(1));
            entries.push_back(message.clone());
            evicted
        };
        for old in evicted {
            tracing::warn!(id = %old.id, "offline queue full, dropping oldest message");
            self.inner.emit(QueueEvent::Dropped {
                id: old.id,
                reason: "Offline queue is full.".to_string(),
            });
        }
        self.inner.persist();
        tracing::debug!(id = %message.id, len = self.len(), "message queued");
    }

    /// Try to deliver everything queued. A no-op while another pass runs, when
    /// the queue is empty, or while offline. Stops early, leaving entries as
    /// they were, if the sender reports that it is not connected.
    pub async fn process_queue(&self) {
        Inner::process(&self.inner).await;
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.entries().iter().any(|m| m.id == id)
    }

    /// Snapshot in delivery order.
    pub fn messages(&self) -> Vec<QueuedMessage> {
        self.inner.entries().iter().cloned().collect()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Stop the connectivity watcher and any scheduled retry. Entries stay
    /// persisted for the next session.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for slot in [&self.inner.watcher, &self.inner.retry] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
    }
}

impl Drop for OfflineQueue {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, VecDeque<QueuedMessage>> {
        lock(&self.entries)
    }

    fn is_offline(&self) -> bool {
        *self.offline.borrow()
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    fn persist(&self) {
        let snapshot = self.entries().clone();
        let result = if snapshot.is_empty() {
            self.store.remove(&self.key)
        } else {
            set_json(self.store.as_ref(), &self.key, &snapshot)
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, key = %self.key, "failed to persist offline queue");
        }
    }

    async fn process(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(send) = self.sender.get().cloned() else {
            tracing::debug!("offline queue has no sender yet");
            return;
        };
        if self.is_offline() || self.entries().is_empty() {
            return;
        }
        let Some(_pass) = PassGuard::acquire(&self.processing) else {
            tracing::debug!("queue pass already running");
            return;
        };

        let batch: Vec<QueuedMessage> = self.entries().iter().cloned().collect();
        tracing::info!(count = batch.len(), "processing offline queue");

        for message in batch {
            if self.is_offline() {
                tracing::info!("went offline, pausing queue pass");
                break;
            }
            let id = message.id.clone();
            match send(message.clone()).await {
                Ok(()) => {
                    self.entries().retain(|m| m.id != id);
                    tracing::debug!(id = %id, "queued message sent");
                    self.emit(QueueEvent::Sent { id });
                }
                Err(ClientError::NotConnected) => {
                    tracing::info!(id = %id, "transport not connected, pausing queue pass");
                    break;
                }
                Err(e) => self.record_failure(&message, &e),
            }
            self.persist();
        }

        let remaining = self.entries().len();
        if remaining == 0 {
            self.cancel_retry();
        } else {
            self.schedule_retry();
        }
    }

    fn record_failure(&self, message: &QueuedMessage, error: &ClientError) {
        let attempts = message.retry_count.saturating_add(1);
        if attempts >= self.config.max_retry_count {
            let removed = {
                let mut entries = self.entries();
                let before = entries.len();
                entries.retain(|m| m.id != message.id);
                entries.len() != before
            };
            if !removed {
                // Evicted while in flight; its drop was already reported.
                return;
            }
            tracing::warn!(id = %message.id, attempts, error = %error, "dropping queued message, out of retries");
            self.emit(QueueEvent::Dropped {
                id: message.id.clone(),
                reason: format!("Message could not be delivered: {error}"),
            });
            return;
        }
        tracing::debug!(id = %message.id, attempts, error = %error, "queued message failed, will retry");
        // Updated in place so it keeps its position ahead of newer entries.
        if let Some(entry) = self.entries().iter_mut().find(|m| m.id == message.id) {
            entry.retry_count = attempts;
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        let delay = self.config.retry_delay();
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Detach ourselves so the pass below cannot abort its own task.
            drop(lock(&inner.retry).take());
            Inner::process(&inner).await;
        });
        if let Some(previous) = lock(&self.retry).replace(task) {
            previous.abort();
        }
        tracing::debug!(delay_ms = delay.as_millis() as u64, "queue retry scheduled");
    }

    fn cancel_retry(&self) {
        if let Some(task) = lock(&self.retry).take() {
            task.abort();
        }
    }
}

/// Drop entries from the front until at most `keep` remain.
fn evict_to(entries: &mut VecDeque<QueuedMessage>, keep: usize) -> Vec<QueuedMessage> {
    let excess = entries.len().saturating_sub(keep);
    entries.drain(..excess).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds the in-flight flag for one pass; clears it on drop, including when
/// the pass is cancelled.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn watch_connectivity(
    inner: Weak<Inner>,
    mut offline: watch::Receiver<bool>,
    mut was_offline: bool,
) {
    while offline.changed().await.is_ok() {
        let now_offline = *offline.borrow_and_update();
        let came_online = was_offline && !now_offline;
        was_offline = now_offline;
        if !came_online {
            continue;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        tracing::info!("connectivity restored, flushing offline queue");
        Inner::process(&inner).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportError;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn session() -> SessionId {
        "s-1".parse().unwrap()
    }

    fn queue(config: QueueConfig, connectivity: &Connectivity) -> OfflineQueue {
        OfflineQueue::new(&session(), config, Arc::new(MemoryStore::new()), connectivity)
    }

    fn closed() -> ClientError {
        ClientError::Transport(TransportError::Closed)
    }

    fn counting_sender(
        queue: &OfflineQueue,
        fail: impl Fn(&QueuedMessage, usize) -> Option<ClientError> + Send + Sync + 'static,
    ) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let fail = Arc::new(fail);
        queue.set_sender(move |message| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let fail = fail.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                match fail(&message, n) {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        });
        calls
    }

    #[tokio::test]
    async fn bounded_drop_keeps_newest() {
        let online = Connectivity::online();
        let q = queue(QueueConfig::default(), &online);
        let mut events = q.subscribe();
        let first = q.enqueue("0", session());
        for i in 1..=100 {
            q.enqueue(i.to_string(), session());
        }
        assert_eq!(q.len(), 100);
        let contents: Vec<_> = q.messages().into_iter().map(|m| m.content).collect();
        let expected: Vec<_> = (1..=100).map(|i| i.to_string()).collect();
        assert_eq!(contents, expected);
        assert!(matches!(
            events.try_recv(),
            Ok(QueueEvent::Dropped { id, .. }) if id == first.id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_drops_after_max_failures() {
        let online = Connectivity::online();
        let q = queue(QueueConfig::default(), &online);
        let calls = counting_sender(&q, |_, _| Some(closed()));
        let mut events = q.subscribe();
        let queued = q.enqueue("doomed", session());

        q.process_queue().await;
        assert_eq!(q.messages()[0].retry_count, 1);

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            QueueEvent::Dropped {
                id: queued.id.clone(),
                reason: "Message could not be delivered: socket closed".into(),
            }
        );
        assert!(q.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!q.contains(&queued.id));
    }

    #[tokio::test(start_paused = true)]
    async fn passes_do_not_overlap() {
        let online = Connectivity::online();
        let q = queue(QueueConfig::default(), &online);
        let calls = counting_sender(&q, |_, _| None);
        q.enqueue("a", session());
        q.enqueue("b", session());

        tokio::join!(q.process_queue(), q.process_queue());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(q.is_empty());
        assert!(!q.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_is_a_noop_until_connectivity_returns() {
        let connectivity = Connectivity::new(true);
        let q = queue(QueueConfig::default(), &connectivity);
        let calls = counting_sender(&q, |_, _| None);
        let mut events = q.subscribe();
        let queued = q.enqueue("hello", session());

        q.process_queue().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(q.len(), 1);

        connectivity.set_offline(false);
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Sent { id: queued.id });
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connectivity_change_right_after_creation_is_not_lost() {
        let connectivity = Connectivity::new(true);
        let q = queue(QueueConfig::default(), &connectivity);
        let calls = counting_sender(&q, |_, _| None);
        let mut events = q.subscribe();
        let queued = q.enqueue("early", session());

        // No await in between: the watcher has not been polled yet.
        connectivity.set_offline(false);
        let sent = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
        assert_eq!(sent.unwrap().unwrap(), QueueEvent::Sent { id: queued.id });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn not_connected_pauses_without_spending_retries() {
        let online = Connectivity::online();
        let q = queue(QueueConfig::default(), &online);
        // The transport comes up after four passes, more than the retry budget.
        let calls = counting_sender(&q, |_, n| (n < 4).then_some(ClientError::NotConnected));
        let mut events = q.subscribe();
        let a = q.enqueue("a", session());
        let b = q.enqueue("b", session());

        q.process_queue().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(q.messages().iter().all(|m| m.retry_count == 0));

        assert_eq!(events.recv().await.unwrap(), QueueEvent::Sent { id: a.id });
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Sent { id: b.id });
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_evicted_mid_pass_is_reported_once() {
        let online = Connectivity::online();
        let config = QueueConfig {
            max_size: 1,
            max_retry_count: 1,
            ..QueueConfig::default()
        };
        let q = queue(config, &online);
        counting_sender(&q, |_, _| Some(closed()));
        let mut events = q.subscribe();
        let a = q.enqueue("a", session());

        let (_, b) = tokio::join!(q.process_queue(), async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            q.enqueue("b", session())
        });

        assert_eq!(
            events.try_recv().unwrap(),
            QueueEvent::Dropped {
                id: a.id,
                reason: "Offline queue is full.".into(),
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(q.messages(), vec![b]);
        q.close();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_entry_stays_ahead_and_retries_after_delay() {
        let online = Connectivity::online();
        let q = queue(QueueConfig::default(), &online);
        // Only the very first send fails.
        let calls = counting_sender(&q, |_, n| (n == 0).then(closed));
        let mut events = q.subscribe();
        let a = q.enqueue("a", session());
        let b = q.enqueue("b", session());

        q.process_queue().await;
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Sent { id: b.id });
        let left = q.messages();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, a.id);
        assert_eq!(left[0].retry_count, 1);

        let c = q.enqueue("c", session());
        let order: Vec<_> = q.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(order, vec![a.id.clone(), c.id.clone()]);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert_eq!(events.recv().await.unwrap(), QueueEvent::Sent { id: a.id });
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Sent { id: c.id });
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn entries_survive_a_restart() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let online = Connectivity::online();
        let first = OfflineQueue::new(&session(), QueueConfig::default(), store.clone(), &online);
        let queued = first.enqueue("later", session());
        drop(first);

        let second = OfflineQueue::new(&session(), QueueConfig::default(), store.clone(), &online);
        assert_eq!(second.messages(), vec![queued]);

        let other: SessionId = "s-2".parse().unwrap();
        let unrelated = OfflineQueue::new(&other, QueueConfig::default(), store, &online);
        assert!(unrelated.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_scheduled_retry() {
        let online = Connectivity::online();
        let q = queue(QueueConfig::default(), &online);
        let calls = counting_sender(&q, |_, _| Some(closed()));
        q.enqueue("x", session());
        q.process_queue().await;
        q.close();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(q.len(), 1);
    }
}
