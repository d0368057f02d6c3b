/// TCP live-channel transport with automatic reconnect
use super::backoff::Backoff;
use super::protocol::{read_frame, write_message, Frame, WireMessage};
use super::{Transport, TransportEvent};
use crate::config::Config;
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CHANNEL_BUFFER: usize = 64;
const STOP_GRACE: Duration = Duration::from_secs(2);

type Completion = oneshot::Sender<Result<serde_json::Value>>;

/// Why a connection stopped being served
enum ConnectionEnd {
    Shutdown,
    Dropped(String),
}

/// Reader/writer tasks attached to one TCP stream
struct Connection {
    outbound: mpsc::Sender<WireMessage>,
    frames: mpsc::Receiver<Result<Frame>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct Inner {
    addr: String,
    config: Config,
    events: broadcast::Sender<TransportEvent>,
    pending: Mutex<HashMap<String, Completion>>,
    outbound: Mutex<Option<mpsc::Sender<WireMessage>>>,
    shutdown: watch::Sender<bool>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Length-prefixed JSON over TCP.
///
/// One supervisor task per started transport owns the socket; it serves the
/// connection, and after an unexpected drop fails pending invocations,
/// emits `Disconnected`, reconnects with backoff and emits `Reconnected`.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_reader(mut read_half: OwnedReadHalf, frames: mpsc::Sender<Result<Frame>>) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(frame)) => {
                if frames.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = frames.send(Err(e)).await;
                break;
            }
        }
    }
}

async fn run_writer(mut write_half: OwnedWriteHalf, mut outbound: mpsc::Receiver<WireMessage>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write_message(&mut write_half, &message).await {
            debug!("Write of {} failed: {}", message, e);
            break;
        }
    }
}

impl TcpTransport {
    /// Create a transport for `config.server_addr`. Nothing connects until `start`.
    pub fn new(config: &Config) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                addr: config.server_addr.clone(),
                config: config.clone(),
                events,
                pending: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                shutdown,
                supervisor: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// True while a connection is attached
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.outbound).is_some()
    }
}

impl Inner {
    async fn connect(&self) -> Result<TcpStream> {
        match timeout(self.config.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ChatError::Connection(format!(
                "connect to {} failed: {}",
                self.addr, e
            ))),
            Err(_) => Err(ChatError::Timeout(format!("connect to {}", self.addr))),
        }
    }

    /// Spawn reader/writer tasks and publish the outbound sender
    fn attach(&self, stream: TcpStream) -> Connection {
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (frame_tx, frame_rx) = mpsc::channel(CHANNEL_BUFFER);

        let writer = tokio::spawn(run_writer(write_half, out_rx));
        let reader = tokio::spawn(run_reader(read_half, frame_tx));
        *lock(&self.outbound) = Some(out_tx.clone());

        Connection {
            outbound: out_tx,
            frames: frame_rx,
            reader,
            writer,
        }
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<Completion> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        if !drained.is_empty() {
            debug!("Failing {} pending invocations: {}", drained.len(), reason);
        }
        for tx in drained {
            let _ = tx.send(Err(ChatError::Connection(reason.to_string())));
        }
    }

    async fn supervise(self: Arc<Self>, mut connection: Connection) {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = Backoff::new(
            self.config.reconnect_initial_delay,
            self.config.reconnect_max_delay,
            self.config.max_reconnect_attempts,
        );

        loop {
            let reason = match self.serve(connection, &mut shutdown).await {
                ConnectionEnd::Shutdown => {
                    self.fail_pending("transport stopped");
                    return;
                }
                ConnectionEnd::Dropped(reason) => reason,
            };

            warn!("Connection to {} lost: {}", self.addr, reason);
            self.fail_pending("connection lost");
            self.emit(TransportEvent::Disconnected { reason });

            backoff.reset();
            let stream = loop {
                let Some(delay) = backoff.next_delay() else {
                    error!(
                        "Giving up on {} after {} reconnect attempts",
                        self.addr,
                        backoff.attempts()
                    );
                    self.emit(TransportEvent::Disconnected {
                        reason: "reconnect attempts exhausted".to_string(),
                    });
                    return;
                };

                debug!(
                    "Reconnecting to {} in {:?} (attempt {})",
                    self.addr,
                    delay,
                    backoff.attempts()
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = wait_for_shutdown(&mut shutdown) => return,
                }

                match self.connect().await {
                    Ok(stream) => break stream,
                    Err(e) => warn!("Reconnect attempt {} failed: {}", backoff.attempts(), e),
                }
            };

            info!("Reconnected to {}", self.addr);
            connection = self.attach(stream);
            self.emit(TransportEvent::Reconnected);
        }
    }

    async fn serve(
        &self,
        connection: Connection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ConnectionEnd {
        let Connection {
            outbound,
            mut frames,
            reader,
            writer,
        } = connection;
        let mut awaiting_pong = false;

        let end = loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown) => {
                    let _ = outbound
                        .send(WireMessage::Close { reason: "client stopped".to_string() })
                        .await;
                    break ConnectionEnd::Shutdown;
                }
                next = timeout(self.config.keepalive_interval, frames.recv()) => {
                    match next {
                        Err(_) => {
                            if awaiting_pong {
                                break ConnectionEnd::Dropped("keepalive timeout".to_string());
                            }
                            awaiting_pong = true;
                            let ping = WireMessage::Ping {
                                timestamp: chrono::Utc::now().timestamp_millis(),
                            };
                            if outbound.send(ping).await.is_err() {
                                break ConnectionEnd::Dropped("writer closed".to_string());
                            }
                        }
                        Ok(None) => {
                            break ConnectionEnd::Dropped("connection closed by server".to_string());
                        }
                        Ok(Some(Err(e))) => break ConnectionEnd::Dropped(e.to_string()),
                        Ok(Some(Ok(frame))) => {
                            // Any traffic proves liveness
                            awaiting_pong = false;
                            match frame.message() {
                                Ok(message) => {
                                    if let Some(end) = self.dispatch(message, &outbound).await {
                                        break end;
                                    }
                                }
                                Err(e) => warn!("Dropping frame from {}: {}", self.addr, e),
                            }
                        }
                    }
                }
            }
        };

        *lock(&self.outbound) = None;
        drop(outbound);
        reader.abort();
        // Let the writer flush a pending Close
        let _ = timeout(Duration::from_secs(1), writer).await;
        end
    }

    async fn dispatch(
        &self,
        message: WireMessage,
        outbound: &mpsc::Sender<WireMessage>,
    ) -> Option<ConnectionEnd> {
        match message {
            WireMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let waiter = lock(&self.pending).remove(&invocation_id);
                match waiter {
                    Some(tx) => {
                        let outcome = match error {
                            Some(e) => Err(ChatError::Remote(e)),
                            None => Ok(result.unwrap_or(serde_json::Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => debug!("Completion for unknown invocation {}", invocation_id),
                }
            }
            WireMessage::Event { name, args } => {
                debug!("Event {} from {}", name, self.addr);
                self.emit(TransportEvent::Event { name, args });
            }
            WireMessage::Ping { timestamp } => {
                let _ = outbound.send(WireMessage::Pong { timestamp }).await;
            }
            WireMessage::Pong { .. } => debug!("Received pong from {}", self.addr),
            WireMessage::Close { reason } => {
                info!("Server {} closed connection: {}", self.addr, reason);
                return Some(ConnectionEnd::Dropped(format!("closed by server: {}", reason)));
            }
            WireMessage::Invoke { method, .. } => {
                warn!("Ignoring server-side invocation of {}", method);
            }
        }
        None
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> Result<()> {
        let mut supervisor = self.inner.supervisor.lock().await;
        if let Some(handle) = supervisor.as_ref() {
            if !handle.is_finished() {
                return Ok(());
            }
        }

        self.inner.shutdown.send_replace(false);
        let stream = self.inner.connect().await?;
        info!("Connected to {}", self.inner.addr);

        let connection = self.inner.attach(stream);
        let inner = self.inner.clone();
        *supervisor = Some(tokio::spawn(inner.supervise(connection)));
        Ok(())
    }

    async fn invoke(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let sender = lock(&self.inner.outbound)
            .clone()
            .ok_or_else(|| ChatError::Connection("transport not connected".to_string()))?;

        let invocation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(invocation_id.clone(), tx);

        let call = WireMessage::Invoke {
            invocation_id: invocation_id.clone(),
            method: method.to_string(),
            args,
        };
        if sender.send(call).await.is_err() {
            lock(&self.inner.pending).remove(&invocation_id);
            return Err(ChatError::Connection("connection closed".to_string()));
        }

        match timeout(self.inner.config.invoke_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ChatError::Connection(
                "connection closed before ack".to_string(),
            )),
            Err(_) => {
                lock(&self.inner.pending).remove(&invocation_id);
                Err(ChatError::Timeout(format!("{} invocation", method)))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    async fn stop(&self) {
        self.inner.shutdown.send_replace(true);

        let handle = self.inner.supervisor.lock().await.take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Transport supervisor for {} did not stop in time", self.inner.addr);
                abort.abort();
            }
            info!("Transport to {} stopped", self.inner.addr);
        }

        *lock(&self.inner.outbound) = None;
        self.inner.fail_pending("transport stopped");
    }
}
