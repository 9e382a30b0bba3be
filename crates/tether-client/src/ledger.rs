//! Message ledger.
//!
//! The authoritative, ordered, deduplicated list of messages for one session.
//! Order is `(timestamp, id)` ascending; the id breaks ties between messages
//! created in the same instant so every client shows the same order.

use crate::StoreError;
use crate::store::{KeyValueStore, get_json, set_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tether_core::{
    ChatMessage, META_SERVER_ID, MessageFrame, MessageStatus, Sender, SessionId, StreamFrame,
};

pub struct MessageLedger {
    session_id: SessionId,
    messages: Vec<ChatMessage>,
    ids: HashSet<String>,
    /// Server-assigned id -> local id, for messages the server renamed.
    aliases: HashMap<String, String>,
}

impl MessageLedger {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            messages: Vec::new(),
            ids: HashSet::new(),
            aliases: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Sorted snapshot.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id) || self.aliases.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        let id = self.aliases.get(id).map(String::as_str).unwrap_or(id);
        self.messages.iter().find(|m| m.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut ChatMessage> {
        let id = self.aliases.get(id).cloned().unwrap_or_else(|| id.to_string());
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Messages still waiting for delivery.
    pub fn pending(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.is_pending())
    }

    /// Insert in order. Re-adding a known id is a no-op; returns whether the
    /// message was inserted.
    pub fn add(&mut self, message: ChatMessage) -> bool {
        if !self.accepts(&message) {
            return false;
        }
        let key = (message.timestamp, message.id.as_str());
        let at = self.messages.partition_point(|m| m.order_key() < key);
        self.ids.insert(message.id.clone());
        self.messages.insert(at, message);
        true
    }

    /// Add many messages at once, e.g. a history page. Returns how many were new.
    pub fn merge(&mut self, messages: impl IntoIterator<Item = ChatMessage>) -> usize {
        let mut added = 0;
        for message in messages {
            if self.accepts(&message) {
                self.ids.insert(message.id.clone());
                self.messages.push(message);
                added += 1;
            }
        }
        if added > 0 {
            self.validate_and_fix_order();
        }
        added
    }

    fn accepts(&self, message: &ChatMessage) -> bool {
        if message.session_id != self.session_id {
            tracing::warn!(
                id = %message.id,
                session = %message.session_id,
                "ignoring message for another session"
            );
            return false;
        }
        !self.contains(&message.id)
    }

    /// Re-sort if any adjacent pair is out of order. Returns whether it had to.
    pub fn validate_and_fix_order(&mut self) -> bool {
        let sorted = self
            .messages
            .windows(2)
            .all(|pair| pair[0].order_key() <= pair[1].order_key());
        if sorted {
            return false;
        }
        tracing::debug!(len = self.messages.len(), "ledger out of order, re-sorting");
        self.messages
            .sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        true
    }

    /// Keep only the newest `keep_last` messages. Returns how many were dropped.
    pub fn prune(&mut self, keep_last: usize) -> usize {
        if self.messages.len() <= keep_last {
            return 0;
        }
        let excess = self.messages.len() - keep_last;
        for dropped in self.messages.drain(..excess) {
            self.ids.remove(&dropped.id);
            self.aliases.retain(|_, local| *local != dropped.id);
        }
        tracing::debug!(dropped = excess, kept = keep_last, "ledger pruned");
        excess
    }

    /// Messages strictly between `after` and `before`. With a `limit`, the
    /// most recent matching entries are kept.
    pub fn window(
        &self,
        before: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<ChatMessage> {
        let matching: Vec<&ChatMessage> = self
            .messages
            .iter()
            .filter(|m| before.is_none_or(|b| m.timestamp < b))
            .filter(|m| after.is_none_or(|a| m.timestamp > a))
            .collect();
        let skip = limit.map_or(0, |l| matching.len().saturating_sub(l));
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn mark_sent(&mut self, id: &str) -> bool {
        self.get_mut(id).is_some_and(ChatMessage::mark_sent)
    }

    pub fn mark_error(&mut self, id: &str, reason: &str) -> bool {
        self.get_mut(id).is_some_and(|m| m.mark_error(reason))
    }

    /// Match a user `message` frame from the server against a pending local
    /// message. Returns the local id it acknowledged, if any.
    ///
    /// Matching is by id, then by `reply_to`, then by identical content of the
    /// oldest pending user message (the server may mint its own id).
    pub fn acknowledge(&mut self, frame: &MessageFrame) -> Option<String> {
        // A known id settles it even when that message is no longer pending,
        // so a late echo cannot acknowledge some other message by content.
        let by_id = [Some(frame.message_id.as_str()), frame.reply_to.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|id| {
                self.get(id)
                    .filter(|m| m.sender == Sender::User)
                    .map(|m| m.id.clone())
            });
        let local = match by_id {
            Some(id) => id,
            None => self
                .pending()
                .find(|m| m.sender == Sender::User && m.content == frame.content)
                .map(|m| m.id.clone())?,
        };

        if frame.message_id != local && !self.ids.contains(&frame.message_id) {
            self.aliases.insert(frame.message_id.clone(), local.clone());
            if let Some(m) = self.get_mut(&local) {
                m.metadata.insert(
                    META_SERVER_ID.to_string(),
                    Value::String(frame.message_id.clone()),
                );
            }
        }
        self.mark_sent(&local).then_some(local)
    }

    /// Fold a streamed chunk into its agent message, creating it on the first
    /// chunk. Returns the message id.
    pub fn apply_chunk(&mut self, frame: &StreamFrame, timestamp: DateTime<Utc>) -> String {
        let id = frame.message_id.clone();
        match self.get_mut(&id) {
            Some(message) if message.is_pending() => {
                message.content.push_str(&frame.chunk);
                if let Some(format) = frame.format {
                    message.format = format;
                }
                if frame.is_complete {
                    message.mark_sent();
                }
            }
            Some(_) => {
                tracing::debug!(id = %id, "chunk for a finished message ignored");
            }
            None => {
                let mut message = ChatMessage::received(
                    id.clone(),
                    self.session_id.clone(),
                    Sender::Agent,
                    frame.chunk.clone(),
                    frame.format.unwrap_or_default(),
                    timestamp,
                );
                if !frame.is_complete {
                    message.status = MessageStatus::Sending;
                }
                self.add(message);
            }
        }
        id
    }

    /// Persist under the session's cache key.
    pub fn save(&self, store: &dyn KeyValueStore) -> Result<(), StoreError> {
        self.snapshot().save(store)
    }

    /// Copy of the current contents that can be written later, without
    /// borrowing the ledger.
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            key: cache_key(&self.session_id),
            cached: CachedLedger {
                saved_at: Utc::now(),
                messages: self.messages.clone(),
            },
        }
    }

    /// Load cached messages. A cache saved more than `ttl` before `now` is
    /// dropped and yields nothing.
    pub fn load_cached(
        store: &dyn KeyValueStore,
        session_id: &SessionId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let key = cache_key(session_id);
        let Some(cached) = get_json::<CachedLedger>(store, &key)? else {
            return Ok(Vec::new());
        };
        let age = now.signed_duration_since(cached.saved_at);
        let expired = age.to_std().is_ok_and(|age| age > ttl);
        if expired {
            tracing::info!(session = %session_id, "cached history expired");
            store.remove(&key)?;
            return Ok(Vec::new());
        }
        Ok(cached.messages)
    }
}

#[derive(Serialize, Deserialize)]
struct CachedLedger {
    saved_at: DateTime<Utc>,
    messages: Vec<ChatMessage>,
}

/// See [`MessageLedger::snapshot`].
pub struct LedgerSnapshot {
    key: String,
    cached: CachedLedger,
}

impl LedgerSnapshot {
    pub fn save(&self, store: &dyn KeyValueStore) -> Result<(), StoreError> {
        set_json(store, &self.key, &self.cached)
    }
}

pub fn cache_key(session_id: &SessionId) -> String {
    format!("tether:messages:{session_id}")
}
