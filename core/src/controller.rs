/// Session controller: wires the connection session, the history service and
/// the message store together for one signed-in user
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::events::{ConversationSummary, SendReceipt, SessionSignal};
use crate::history::{records_into_messages, HistoryService, HttpHistoryService};
use crate::message::{ChatMessage, Origin};
use crate::message_store::{InsertOutcome, MessageStore};
use crate::session::{ConnectionSession, HandlerId, SessionState};
use crate::transport::{TcpTransport, Transport};
use dashmap::{DashMap, DashSet};
use futures_util::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of `activate`: connection status plus the seeded conversation list
#[derive(Debug)]
pub struct Activation {
    pub connection: Result<()>,
    pub conversations: Vec<ConversationSummary>,
}

/// What happened to an outgoing message after it was shown locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The server acknowledged the message
    Confirmed(SendReceipt),
    /// The message is visible locally but the server has not accepted it
    Unconfirmed,
}

struct ControllerInner {
    user_id: String,
    store: MessageStore,
    history: Arc<dyn HistoryService>,
    fetch_history: bool,
    loaded: DashSet<String>,
    summaries: DashMap<String, ConversationSummary>,
    updates: broadcast::Sender<ChatMessage>,
}

pub struct SessionController {
    inner: Arc<ControllerInner>,
    session: ConnectionSession,
    handler: Mutex<Option<HandlerId>>,
    backfill: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keep the conversation list preview pointing at the newest message
fn record_preview(
    summaries: &DashMap<String, ConversationSummary>,
    participant_id: &str,
    message: &ChatMessage,
) {
    let mut summary = summaries
        .entry(participant_id.to_string())
        .or_insert_with(|| ConversationSummary {
            participant_id: participant_id.to_string(),
            last_message_preview: String::new(),
            last_timestamp: None,
        });
    if summary
        .last_timestamp
        .map_or(true, |ts| message.client_timestamp() >= ts)
    {
        summary.last_message_preview = message.text().to_string();
        summary.last_timestamp = Some(message.client_timestamp());
    }
}

impl ControllerInner {
    /// Fetch one conversation's history into the store. Returns the number of
    /// messages that were new.
    async fn load_history(&self, participant_id: &str) -> Result<usize> {
        let records = self.history.fetch_history(participant_id).await?;
        let mut inserted = 0;
        for message in records_into_messages(records) {
            record_preview(&self.summaries, message.counterpart(&self.user_id), &message);
            if self.store.insert(message) == InsertOutcome::Inserted {
                inserted += 1;
            }
        }
        self.loaded.insert(participant_id.to_string());
        debug!(
            "Loaded history for {}: {} new messages",
            participant_id, inserted
        );
        Ok(inserted)
    }

    /// Re-fetch every loaded conversation after a re-join
    async fn backfill(&self) {
        let participants: Vec<String> = self.loaded.iter().map(|p| p.key().clone()).collect();
        if participants.is_empty() {
            return;
        }
        info!("Backfilling {} conversations after re-join", participants.len());
        let results = join_all(participants.iter().map(|p| self.load_history(p))).await;
        for (participant, result) in participants.iter().zip(results) {
            if let Err(e) = result {
                warn!("Backfill for {} failed: {}", participant, e);
            }
        }
    }
}

impl SessionController {
    pub fn new(
        user_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistoryService>,
        config: &Config,
    ) -> Self {
        let user_id: String = user_id.into();
        let (updates, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            session: ConnectionSession::new(user_id.clone(), transport, config),
            inner: Arc::new(ControllerInner {
                store: MessageStore::new(user_id.clone()),
                user_id,
                history,
                fetch_history: config.fetch_history,
                loaded: DashSet::new(),
                summaries: DashMap::new(),
                updates,
            }),
            handler: Mutex::new(None),
            backfill: Mutex::new(None),
        }
    }

    /// Build a controller over TCP and HTTP from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(config));
        let history: Arc<dyn HistoryService> = Arc::new(
            HttpHistoryService::new(config.history_url.clone(), config.auth_token.clone())
                .with_timeout(config.invoke_timeout),
        );
        Ok(Self::new(config.user_id.clone(), transport, history, config))
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub async fn state(&self) -> SessionState {
        self.session.state().await
    }

    pub fn signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.session.signals()
    }

    /// Live messages that were new to the store
    pub fn updates(&self) -> broadcast::Receiver<ChatMessage> {
        self.inner.updates.subscribe()
    }

    /// Route live messages into the store, connect, and seed conversations
    /// from the history service concurrently.
    pub async fn activate(&self) -> Activation {
        if self.session.state().await == SessionState::Closed {
            return Activation {
                connection: Err(ChatError::AlreadyClosed),
                conversations: Vec::new(),
            };
        }

        self.install_handler();
        self.spawn_backfill();

        let (connection, conversations) =
            tokio::join!(self.session.connect(), self.seed_conversations());
        if let Err(e) = &connection {
            warn!("Live channel unavailable for {}: {}", self.inner.user_id, e);
        }

        Activation {
            connection,
            conversations,
        }
    }

    /// Retry the live channel after `ConnectFailed`
    pub async fn reconnect(&self) -> Result<()> {
        self.session.connect().await
    }

    /// Open a conversation, fetching its history the first time
    pub async fn open_conversation(&self, participant_id: &str) -> Result<Vec<ChatMessage>> {
        if self.session.state().await == SessionState::Closed {
            return Err(ChatError::AlreadyClosed);
        }

        self.inner.store.open(participant_id);
        if self.inner.fetch_history && !self.inner.loaded.contains(participant_id) {
            // A failed fetch leaves the conversation unloaded so the next open retries
            if let Err(e) = self.inner.load_history(participant_id).await {
                warn!("History fetch for {} failed: {}", participant_id, e);
            }
        }
        Ok(self.inner.store.list(participant_id))
    }

    /// Snapshot of a conversation without touching the history service
    pub fn conversation(&self, participant_id: &str) -> Vec<ChatMessage> {
        self.inner.store.list(participant_id)
    }

    /// Known conversations, most recent first
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        let mut list: Vec<ConversationSummary> = self
            .inner
            .summaries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        list.sort_by(|a, b| {
            b.last_timestamp
                .cmp(&a.last_timestamp)
                .then_with(|| a.participant_id.cmp(&b.participant_id))
        });
        list
    }

    /// Show the message locally, then put it on the wire.
    ///
    /// A send the transport cannot deliver leaves the message visible with no
    /// server timestamp and reports `SendOutcome::Unconfirmed`.
    pub async fn send_message(&self, participant_id: &str, text: &str) -> Result<SendOutcome> {
        if self.session.state().await == SessionState::Closed {
            return Err(ChatError::AlreadyClosed);
        }

        let message = ChatMessage::new(
            self.inner.user_id.clone(),
            participant_id,
            text,
            chrono::Utc::now().timestamp_millis(),
            Origin::Local,
        )?;
        let key = message.key();

        record_preview(&self.inner.summaries, participant_id, &message);
        self.inner.store.append_optimistic(message.clone());

        match self.session.send(&message).await {
            Ok(receipt) => {
                self.inner.store.confirm(&key, receipt.server_timestamp);
                Ok(SendOutcome::Confirmed(receipt))
            }
            Err(ChatError::AlreadyClosed) => Err(ChatError::AlreadyClosed),
            Err(e) => {
                info!("Message {} left unconfirmed: {}", key, e);
                Ok(SendOutcome::Unconfirmed)
            }
        }
    }

    /// Close the live channel and drop every conversation
    pub async fn teardown(&self) {
        if let Some(id) = lock(&self.handler).take() {
            self.session.remove_handler(id);
        }
        self.session.close().await;
        if let Some(task) = lock(&self.backfill).take() {
            task.abort();
        }

        self.inner.store.clear();
        self.inner.loaded.clear();
        self.inner.summaries.clear();
        info!("Chat session for {} torn down", self.inner.user_id);
    }

    async fn seed_conversations(&self) -> Vec<ConversationSummary> {
        if !self.inner.fetch_history {
            return self.conversations();
        }

        match self.inner.history.fetch_conversation_list().await {
            Ok(list) => {
                for summary in &list {
                    self.inner.store.open(&summary.participant_id);
                    self.inner
                        .summaries
                        .entry(summary.participant_id.clone())
                        .or_insert_with(|| summary.clone());
                }
                let results = join_all(
                    list.iter()
                        .map(|summary| self.inner.load_history(&summary.participant_id)),
                )
                .await;
                for (summary, result) in list.iter().zip(results) {
                    if let Err(e) = result {
                        warn!("History fetch for {} failed: {}", summary.participant_id, e);
                    }
                }
            }
            Err(e) => warn!("Conversation list fetch failed: {}", e),
        }
        self.conversations()
    }

    fn install_handler(&self) {
        let mut slot = lock(&self.handler);
        if slot.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let id = self.session.on_message(move |message| {
            let participant = message.counterpart(&inner.user_id).to_string();
            record_preview(&inner.summaries, &participant, &message);
            if inner.store.insert(message.clone()) == InsertOutcome::Inserted {
                debug!("Live message stored for conversation {}", participant);
                let _ = inner.updates.send(message);
            }
        });
        *slot = Some(id);
    }

    fn spawn_backfill(&self) {
        let mut slot = lock(&self.backfill);
        if slot.is_some() || !self.inner.fetch_history {
            return;
        }

        // Subscribed before connect() so the first Joined is not missed
        let mut signals = self.session.signals();
        let inner = self.inner.clone();
        *slot = Some(tokio::spawn(async move {
            let mut dropped = false;
            loop {
                match signals.recv().await {
                    Ok(SessionSignal::Reconnecting) => dropped = true,
                    Ok(SessionSignal::Joined) if dropped => {
                        dropped = false;
                        inner.backfill().await;
                    }
                    Ok(SessionSignal::Closed) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }
}
