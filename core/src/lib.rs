//! LeaseChat - real-time landlord/tenant messaging session core
//!
//! Keeps one persistent live channel per signed-in user, merges messages
//! arriving through the live channel and the history service into
//! de-duplicated, timestamp-ordered conversations, and recovers from
//! connection loss by re-joining the channel.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod history;
pub mod message;
pub mod message_store;
pub mod session;
pub mod transport;

pub use config::Config;
pub use controller::{Activation, SendOutcome, SessionController};
pub use error::{ChatError, Result};
pub use events::{ConversationSummary, LiveMessageEvent, SendReceipt, SessionSignal};
pub use history::{HistoryRecord, HistoryService, HttpHistoryService};
pub use message::{ChatMessage, MessageKey, Origin};
pub use message_store::{InsertOutcome, MessageStore};
pub use session::{ConnectionSession, HandlerId, SessionState};
pub use transport::{TcpTransport, Transport, TransportEvent};
