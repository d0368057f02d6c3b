/// Deduplicating message store: one ordered conversation per participant
///
/// Every arrival path (optimistic local write, live push, history replay)
/// funnels through `insert`, which drops anything whose identity key is
/// already present in the conversation.
use crate::message::{ChatMessage, MessageKey, Origin};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of an insertion attempt. `Duplicate` is a normal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Messages exchanged with one participant, ascending by client timestamp
#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<ChatMessage>,
    keys: HashSet<MessageKey>,
}

impl Conversation {
    fn insert(&mut self, message: ChatMessage) -> InsertOutcome {
        let key = message.key();
        if self.keys.contains(&key) {
            return InsertOutcome::Duplicate;
        }

        // Equal timestamps keep arrival order
        let ts = message.client_timestamp();
        let pos = self.messages.partition_point(|m| m.client_timestamp() <= ts);
        self.messages.insert(pos, message);
        self.keys.insert(key);
        InsertOutcome::Inserted
    }
}

/// Shared handle to the conversations of one signed-in user.
///
/// Cloning is cheap and yields a handle to the same conversations. Each
/// conversation is guarded by its own shard lock, so concurrent inserts from
/// the live-event handler and the sender serialize per conversation.
#[derive(Clone)]
pub struct MessageStore {
    local_user: Arc<str>,
    conversations: Arc<DashMap<String, Conversation>>,
}

impl MessageStore {
    /// Create an empty store for `local_user`
    pub fn new(local_user: impl Into<String>) -> Self {
        let local_user: String = local_user.into();
        Self {
            local_user: Arc::from(local_user),
            conversations: Arc::new(DashMap::new()),
        }
    }

    /// Insert a message into the conversation with its counterpart
    pub fn insert(&self, message: ChatMessage) -> InsertOutcome {
        let participant = message.counterpart(&self.local_user).to_string();
        let key = message.key();
        let outcome = self
            .conversations
            .entry(participant.clone())
            .or_default()
            .insert(message);

        if outcome == InsertOutcome::Duplicate {
            debug!("Dropped duplicate {} in conversation {}", key, participant);
        }
        outcome
    }

    /// Insert a locally-authored message before the transport confirms it
    pub fn append_optimistic(&self, message: ChatMessage) -> InsertOutcome {
        if message.origin() != Origin::Local {
            warn!(
                "Optimistic append of {:?}-origin message {}",
                message.origin(),
                message.key()
            );
        }
        self.insert(message)
    }

    /// Snapshot of one conversation. Empty when the participant is unknown.
    pub fn list(&self, participant_id: &str) -> Vec<ChatMessage> {
        self.conversations
            .get(participant_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Create an empty conversation if none exists yet
    pub fn open(&self, participant_id: &str) {
        self.conversations
            .entry(participant_id.to_string())
            .or_default();
    }

    /// Record the server timestamp for an existing message.
    ///
    /// Returns false when no message with `key` exists. Origin and ordering
    /// are unaffected.
    pub fn confirm(&self, key: &MessageKey, server_timestamp: i64) -> bool {
        let participant = if key.sender_id == *self.local_user {
            &key.receiver_id
        } else {
            &key.sender_id
        };

        let Some(mut conversation) = self.conversations.get_mut(participant.as_str()) else {
            return false;
        };
        match conversation.messages.iter_mut().find(|m| m.key() == *key) {
            Some(slot) => {
                *slot = slot.clone().with_server_timestamp(server_timestamp);
                true
            }
            None => false,
        }
    }

    /// Participants with a conversation in this store, sorted
    pub fn participants(&self) -> Vec<String> {
        let mut out: Vec<String> = self.conversations.iter().map(|e| e.key().clone()).collect();
        out.sort();
        out
    }

    /// Number of messages held for one participant
    pub fn len(&self, participant_id: &str) -> usize {
        self.conversations
            .get(participant_id)
            .map(|c| c.messages.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.iter().all(|c| c.messages.is_empty())
    }

    /// Drop every conversation (session teardown)
    pub fn clear(&self) {
        self.conversations.clear();
    }
}
