/// Connection session: lifecycle of the live channel for one signed-in user
///
/// ```text
/// Idle --connect--> Connecting --join ack--> Joined --drop--> Reconnecting
///   ^                   |                                        |
///   +---- start/join ---+            Connecting <-- reconnected -+
///         failure
/// any --close--> Closed (terminal)
/// ```
///
/// A single pump task per session consumes transport events and performs
/// every join, so a join ack and the live events that follow it are always
/// handled in wire order.
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::events::{LiveMessageEvent, SendReceipt, SessionSignal, WireChatMessage};
use crate::message::ChatMessage;
use crate::transport::{Transport, TransportEvent};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a connection session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected; `connect` may be called
    Idle,
    /// Transport starting or channel join in flight
    Connecting,
    /// Channel joined; sends are accepted
    Joined,
    /// Transport dropped and is retrying; a re-join follows
    Reconnecting,
    /// Torn down; terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Joined => "joined",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Handle returned by `on_message`, used to unregister the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type MessageHandler = Arc<dyn Fn(ChatMessage) + Send + Sync>;

enum Command {
    Join(oneshot::Sender<Result<()>>),
}

struct Pump {
    commands: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

struct Shared {
    user_id: String,
    join_method: String,
    send_method: String,
    receive_event: String,
    transport: Arc<dyn Transport>,
    state: RwLock<SessionState>,
    handlers: StdRwLock<HashMap<HandlerId, MessageHandler>>,
    next_handler: AtomicU64,
    signals: broadcast::Sender<SessionSignal>,
}

pub struct ConnectionSession {
    shared: Arc<Shared>,
    pump: Mutex<Option<Pump>>,
}

impl ConnectionSession {
    /// Create an idle session for `user_id` over `transport`
    pub fn new(user_id: impl Into<String>, transport: Arc<dyn Transport>, config: &Config) -> Self {
        let (signals, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                user_id: user_id.into(),
                join_method: config.join_method.clone(),
                send_method: config.send_method.clone(),
                receive_event: config.receive_event.clone(),
                transport,
                state: RwLock::new(SessionState::Idle),
                handlers: StdRwLock::new(HashMap::new()),
                next_handler: AtomicU64::new(1),
                signals,
            }),
            pump: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub async fn state(&self) -> SessionState {
        *self.shared.state.read().await
    }

    /// Subscribe to connection status signals
    pub fn signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.shared.signals.subscribe()
    }

    /// Start the transport and join the user's channel.
    ///
    /// No-op while already connecting, joined or reconnecting. A transport or
    /// join failure returns the session to `Idle`, publishes
    /// `SessionSignal::ConnectFailed` and returns `ChatError::ConnectFailed`;
    /// retrying is up to the caller.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write().await;
            match *state {
                SessionState::Closed => return Err(ChatError::AlreadyClosed),
                SessionState::Connecting | SessionState::Joined | SessionState::Reconnecting => {
                    debug!("connect() ignored in state {}", *state);
                    return Ok(());
                }
                SessionState::Idle => *state = SessionState::Connecting,
            }
        }
        info!("Session for {} connecting", self.shared.user_id);

        let commands = self.ensure_pump().await;

        if let Err(e) = self.shared.transport.start().await {
            return self.shared.fail_connect(e.to_string()).await;
        }
        if self.state().await == SessionState::Closed {
            self.shared.transport.stop().await;
            return Err(ChatError::AlreadyClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if commands.send(Command::Join(reply_tx)).await.is_err() {
            return Err(ChatError::AlreadyClosed);
        }
        reply_rx.await.unwrap_or(Err(ChatError::AlreadyClosed))
    }

    /// Register a handler for inbound live messages
    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(ChatMessage) + Send + Sync + 'static,
    {
        let id = HandlerId(self.shared.next_handler.fetch_add(1, Ordering::Relaxed));
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, Arc::new(handler));
        id
    }

    /// Unregister a handler. Returns false if it was not registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id)
            .is_some()
    }

    /// Send a message on the live channel. Accepted only while `Joined`.
    ///
    /// Transport failures during the call are reported as `NotConnected`;
    /// nothing is retried.
    pub async fn send(&self, message: &ChatMessage) -> Result<SendReceipt> {
        match self.state().await {
            SessionState::Joined => {}
            SessionState::Closed => return Err(ChatError::AlreadyClosed),
            state => {
                debug!("send() refused in state {}", state);
                return Err(ChatError::NotConnected);
            }
        }

        let payload = serde_json::to_value(WireChatMessage::from_message(message))?;
        match self
            .shared
            .transport
            .invoke(&self.shared.send_method, vec![payload])
            .await
        {
            Ok(ack) => Ok(SendReceipt::from_ack(
                &ack,
                chrono::Utc::now().timestamp_millis(),
            )),
            Err(e) if e.is_transport() => {
                warn!("Send of {} failed: {}", message.key(), e);
                if self.state().await == SessionState::Closed {
                    Err(ChatError::AlreadyClosed)
                } else {
                    Err(ChatError::NotConnected)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Tear the session down. Handlers are unregistered before the transport
    /// is released. Safe to call repeatedly.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.write().await;
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        let removed = {
            let mut handlers = self
                .shared
                .handlers
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let n = handlers.len();
            handlers.clear();
            n
        };
        debug!("Unregistered {} message handlers", removed);

        if let Some(pump) = self.pump.lock().await.take() {
            pump.handle.abort();
        }
        self.shared.transport.stop().await;

        info!("Session for {} closed", self.shared.user_id);
        self.shared.signal(SessionSignal::Closed);
    }

    async fn ensure_pump(&self) -> mpsc::Sender<Command> {
        let mut pump = self.pump.lock().await;
        if let Some(existing) = pump.as_ref() {
            if !existing.handle.is_finished() {
                return existing.commands.clone();
            }
        }

        // Subscribe before the transport starts so no event is missed
        let events = self.shared.transport.subscribe();
        let (commands, command_rx) = mpsc::channel(8);
        let handle = tokio::spawn(self.shared.clone().run_pump(events, command_rx));
        *pump = Some(Pump {
            commands: commands.clone(),
            handle,
        });
        commands
    }
}

impl Shared {
    fn signal(&self, signal: SessionSignal) {
        let _ = self.signals.send(signal);
    }

    async fn run_pump(
        self: Arc<Self>,
        mut events: broadcast::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Join(reply)) => {
                        let outcome = self.join().await;
                        let _ = reply.send(outcome);
                    }
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Session for {} lagged {} transport events", self.user_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Event pump for {} stopped", self.user_id);
    }

    async fn join(&self) -> Result<()> {
        let ack = self
            .transport
            .invoke(&self.join_method, vec![serde_json::json!(self.user_id)])
            .await;

        match ack {
            Ok(_) => {
                let mut state = self.state.write().await;
                let current = *state;
                match current {
                    SessionState::Connecting => {
                        *state = SessionState::Joined;
                        drop(state);
                        info!("Session for {} joined", self.user_id);
                        self.signal(SessionSignal::Joined);
                        Ok(())
                    }
                    SessionState::Closed => Err(ChatError::AlreadyClosed),
                    other => {
                        debug!("Join ack ignored in state {}", other);
                        Ok(())
                    }
                }
            }
            Err(e) => self.fail_connect(format!("join failed: {}", e)).await,
        }
    }

    async fn fail_connect(&self, reason: String) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == SessionState::Closed {
                return Err(ChatError::AlreadyClosed);
            }
            *state = SessionState::Idle;
        }
        warn!("Connect failed for {}: {}", self.user_id, reason);
        self.transport.stop().await;
        self.signal(SessionSignal::ConnectFailed {
            reason: reason.clone(),
        });
        Err(ChatError::ConnectFailed(reason))
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Disconnected { reason } => {
                let mut state = self.state.write().await;
                let current = *state;
                match current {
                    SessionState::Joined | SessionState::Connecting => {
                        *state = SessionState::Reconnecting;
                        drop(state);
                        info!("Session for {} reconnecting: {}", self.user_id, reason);
                        self.signal(SessionSignal::Reconnecting);
                    }
                    SessionState::Reconnecting => {
                        // A second drop without a reconnect: the transport gave up
                        *state = SessionState::Idle;
                        drop(state);
                        warn!("Transport for {} gave up: {}", self.user_id, reason);
                        self.signal(SessionSignal::ConnectFailed { reason });
                    }
                    other => debug!("Disconnect ignored in state {}", other),
                }
            }
            TransportEvent::Reconnected => {
                {
                    let mut state = self.state.write().await;
                    if *state != SessionState::Reconnecting {
                        debug!("Reconnect ignored in state {}", *state);
                        return;
                    }
                    *state = SessionState::Connecting;
                }
                info!("Transport reconnected; re-joining as {}", self.user_id);
                // Failures are published as signals by join()
                let _ = self.join().await;
            }
            TransportEvent::Event { name, args } => {
                let state = *self.state.read().await;
                if !matches!(state, SessionState::Joined | SessionState::Reconnecting) {
                    debug!("Dropping {} event in state {}", name, state);
                    return;
                }
                match LiveMessageEvent::decode(&self.receive_event, &name, &args) {
                    Ok(Some(LiveMessageEvent::Message(message))) => self.deliver(message),
                    Ok(None) => debug!("Ignoring event {}", name),
                    Err(e) => warn!("Dropping malformed {} event: {}", name, e),
                }
            }
        }
    }

    fn deliver(&self, message: ChatMessage) {
        let handlers: Vec<MessageHandler> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            handler(message.clone());
        }
    }
}
