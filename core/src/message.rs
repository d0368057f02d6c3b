/// Message model: one chat message and where it came from
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which arrival path produced a message instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Written by this client before transport confirmation
    Local,
    /// Pushed by the live channel
    Live,
    /// Returned by the history service
    History,
}

/// De-duplication identity of a message within one conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    pub client_timestamp: i64,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.sender_id, self.receiver_id, self.text, self.client_timestamp
        )
    }
}

/// Immutable chat message.
///
/// Fields are private so an instance can only be obtained through
/// [`ChatMessage::new`], which enforces the non-empty invariants. The only
/// derived copy that differs is [`ChatMessage::with_server_timestamp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    sender_id: String,
    receiver_id: String,
    text: String,
    client_timestamp: i64,
    server_timestamp: Option<i64>,
    origin: Origin,
}

impl ChatMessage {
    /// Build a message, trimming `text` and rejecting empty content or ids
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        text: impl AsRef<str>,
        client_timestamp: i64,
        origin: Origin,
    ) -> Result<Self> {
        let sender_id = sender_id.into();
        let receiver_id = receiver_id.into();
        let text = text.as_ref().trim();

        if sender_id.trim().is_empty() {
            return Err(ChatError::InvalidMessage("missing sender id".to_string()));
        }
        if receiver_id.trim().is_empty() {
            return Err(ChatError::InvalidMessage("missing receiver id".to_string()));
        }
        if text.is_empty() {
            return Err(ChatError::InvalidMessage("empty text".to_string()));
        }

        Ok(Self {
            sender_id,
            receiver_id,
            text: text.to_string(),
            client_timestamp,
            server_timestamp: None,
            origin,
        })
    }

    /// Copy of this message carrying a server timestamp; origin is untouched
    pub fn with_server_timestamp(mut self, server_timestamp: i64) -> Self {
        self.server_timestamp = Some(server_timestamp);
        self
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn client_timestamp(&self) -> i64 {
        self.client_timestamp
    }

    pub fn server_timestamp(&self) -> Option<i64> {
        self.server_timestamp
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_confirmed(&self) -> bool {
        self.server_timestamp.is_some()
    }

    /// Identity key used by the store for de-duplication
    pub fn key(&self) -> MessageKey {
        MessageKey {
            sender_id: self.sender_id.clone(),
            receiver_id: self.receiver_id.clone(),
            text: self.text.clone(),
            client_timestamp: self.client_timestamp,
        }
    }

    /// The participant on the other side of `local_user`
    pub fn counterpart(&self, local_user: &str) -> &str {
        if self.sender_id == local_user {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.client_timestamp, self.sender_id, self.text)
    }
}
