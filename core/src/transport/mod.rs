/// Persistent-connection transport used by the connection session
pub mod backoff;
pub mod protocol;
pub mod tcp;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

pub use backoff::Backoff;
pub use protocol::{Frame, WireMessage, MAX_FRAME_LEN};
pub use tcp::TcpTransport;

/// Signals and server events raised by a transport after `start` succeeds
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection dropped; the transport is retrying with backoff
    /// (or has given up, in which case no `Reconnected` follows)
    Disconnected { reason: String },
    /// A new connection replaced a dropped one
    Reconnected,
    /// Named server-pushed event
    Event {
        name: String,
        args: Vec<serde_json::Value>,
    },
}

/// Bidirectional connection with request/ack invocations and pushed events.
///
/// Implementations reconnect on their own after a drop. Application-level
/// state (channel membership) is not restored by the transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection. Idempotent while connected.
    async fn start(&self) -> Result<()>;

    /// Call a server method and wait for its ack
    async fn invoke(&self, method: &str, args: Vec<serde_json::Value>) -> Result<serde_json::Value>;

    /// Receive every subsequent `TransportEvent`
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Tear down the connection and stop reconnecting. Safe to call repeatedly.
    async fn stop(&self);
}
