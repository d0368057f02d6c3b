/// Wire protocol for the live channel
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in one frame
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Messages exchanged with the chat server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// Client-to-server method call awaiting a completion
    #[serde(rename = "invoke")]
    Invoke {
        invocation_id: String,
        method: String,
        args: Vec<serde_json::Value>,
    },

    /// Result of an invocation; exactly one of `result`/`error` is meaningful
    #[serde(rename = "completion")]
    Completion {
        invocation_id: String,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
    },

    /// Server-pushed named event
    #[serde(rename = "event")]
    Event {
        name: String,
        args: Vec<serde_json::Value>,
    },

    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    #[serde(rename = "pong")]
    Pong { timestamp: i64 },

    /// Connection close notification
    #[serde(rename = "close")]
    Close { reason: String },
}

impl WireMessage {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type as string
    pub fn message_type(&self) -> &'static str {
        match self {
            WireMessage::Invoke { .. } => "invoke",
            WireMessage::Completion { .. } => "completion",
            WireMessage::Event { .. } => "event",
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
            WireMessage::Close { .. } => "close",
        }
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WireMessage({})", self.message_type())
    }
}

/// Protocol frame with length prefix
#[derive(Debug)]
pub struct Frame {
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame from a message
    pub fn from_message(message: &WireMessage) -> Result<Self> {
        let payload = message.to_bytes()?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(ChatError::Protocol(format!(
                "frame of {} bytes exceeds limit",
                payload.len()
            )));
        }
        Ok(Self {
            length: payload.len() as u32,
            payload,
        })
    }

    /// Serialize frame to bytes (length prefix + payload)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode the payload
    pub fn message(&self) -> Result<WireMessage> {
        WireMessage::from_bytes(&self.payload)
            .map_err(|e| ChatError::Protocol(format!("Invalid message: {}", e)))
    }
}

/// Read one frame. `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ChatError::Io(e)),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(ChatError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            length
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        length: length as u32,
        payload,
    }))
}

/// Encode and write one message
pub async fn write_message<W>(writer: &mut W, message: &WireMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = Frame::from_message(message)?;
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
