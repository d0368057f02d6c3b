/// Error types for the chat session core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(String),

    /// The remote end answered an invocation with an error
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The live channel could not be established (recoverable by retrying `connect`)
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Send attempted outside the `Joined` state
    #[error("Not connected")]
    NotConnected,

    /// Command issued after the session was closed
    #[error("Session already closed")]
    AlreadyClosed,
}

impl ChatError {
    /// True when the error means the wire itself is unavailable
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChatError::Io(_)
                | ChatError::Connection(_)
                | ChatError::Timeout(_)
                | ChatError::NotConnected
        )
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
