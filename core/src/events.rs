/// Typed events crossing the session boundary
use crate::error::{ChatError, Result};
use crate::message::{ChatMessage, Origin};
use serde::{Deserialize, Serialize};

/// Summary of one conversation thread (for the conversation list view)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// The other party's id
    pub participant_id: String,
    /// Preview text of the last message
    #[serde(default)]
    pub last_message_preview: String,
    /// Client timestamp of the last message, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<i64>,
}

/// Body of a chat message as it travels on the live channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChatMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    pub client_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<i64>,
}

impl WireChatMessage {
    pub fn from_message(message: &ChatMessage) -> Self {
        Self {
            sender_id: message.sender_id().to_string(),
            receiver_id: message.receiver_id().to_string(),
            text: message.text().to_string(),
            client_timestamp: message.client_timestamp(),
            server_timestamp: message.server_timestamp(),
        }
    }

    /// Validate through the message model, tagging the given origin
    pub fn into_message(self, origin: Origin) -> Result<ChatMessage> {
        let message = ChatMessage::new(
            self.sender_id,
            self.receiver_id,
            self.text,
            self.client_timestamp,
            origin,
        )?;
        Ok(match self.server_timestamp {
            Some(ts) => message.with_server_timestamp(ts),
            None => message,
        })
    }
}

/// Live-channel events the session understands.
///
/// Raw transport events are converted here, at the boundary, and never
/// passed further as untyped JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveMessageEvent {
    /// A chat message pushed by the server (including echoes of our own sends)
    Message(ChatMessage),
}

impl LiveMessageEvent {
    /// Decode a named server event. `Ok(None)` for events this core ignores.
    pub fn decode(
        receive_event: &str,
        name: &str,
        args: &[serde_json::Value],
    ) -> Result<Option<Self>> {
        if name != receive_event {
            return Ok(None);
        }

        let payload = args.first().ok_or_else(|| {
            ChatError::Protocol(format!("{} event without payload", name))
        })?;
        let wire: WireChatMessage = serde_json::from_value(payload.clone())?;
        Ok(Some(LiveMessageEvent::Message(wire.into_message(Origin::Live)?)))
    }
}

/// Connection status signals published by the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionSignal {
    /// The channel is joined; sends are accepted
    Joined,
    /// The transport dropped and is retrying on its own
    Reconnecting,
    /// An attempt to establish or re-join the channel failed
    ConnectFailed { reason: String },
    /// The session was torn down
    Closed,
}

/// Acknowledgement of an accepted send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub server_timestamp: i64,
}

impl SendReceipt {
    /// Read `serverTimestamp` from an ack payload, falling back to `received_at`
    pub fn from_ack(ack: &serde_json::Value, received_at: i64) -> Self {
        let server_timestamp = ack
            .get("serverTimestamp")
            .and_then(|v| v.as_i64())
            .or_else(|| ack.as_i64())
            .unwrap_or(received_at);
        Self { server_timestamp }
    }
}
