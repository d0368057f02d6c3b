//! Shared fakes for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use leasechat_core::{
    ChatError, Config, ConversationSummary, HistoryRecord, HistoryService, Result, Transport,
    TransportEvent,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub fn test_config(user_id: &str) -> Config {
    Config {
        user_id: user_id.to_string(),
        reconnect_initial_delay: Duration::from_millis(20),
        reconnect_max_delay: Duration::from_millis(100),
        invoke_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// In-memory transport driven by the test
pub struct FakeTransport {
    events: broadcast::Sender<TransportEvent>,
    pub fail_start: AtomicBool,
    pub fail_join: AtomicBool,
    pub echo_sends: AtomicBool,
    pub online: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    server_clock: AtomicI64,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            fail_start: AtomicBool::new(false),
            fail_join: AtomicBool::new(false),
            echo_sends: AtomicBool::new(false),
            online: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            server_clock: AtomicI64::new(50_000),
        })
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    pub fn last_args(&self, method: &str) -> Option<Vec<Value>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .map(|(_, args)| args.clone())
    }

    pub fn push_event(&self, name: &str, payload: Value) {
        let _ = self.events.send(TransportEvent::Event {
            name: name.to_string(),
            args: vec![payload],
        });
    }

    pub fn push_message(&self, from: &str, to: &str, text: &str, client_timestamp: i64) {
        self.push_event(
            "ReceiveMessage",
            json!({
                "senderId": from,
                "receiverId": to,
                "text": text,
                "clientTimestamp": client_timestamp,
            }),
        );
    }

    pub fn drop_connection(&self) {
        self.online.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Disconnected {
            reason: "connection reset".to_string(),
        });
    }

    pub fn restore(&self) {
        self.online.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Reconnected);
    }

    pub fn give_up(&self) {
        let _ = self.events.send(TransportEvent::Disconnected {
            reason: "reconnect attempts exhausted".to_string(),
        });
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ChatError::Connection("connection refused".to_string()));
        }
        self.online.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), args.clone()));

        if !self.online.load(Ordering::SeqCst) {
            return Err(ChatError::Connection("offline".to_string()));
        }

        match method {
            "JoinChat" => {
                if self.fail_join.load(Ordering::SeqCst) {
                    Err(ChatError::Remote("join rejected".to_string()))
                } else {
                    Ok(Value::Null)
                }
            }
            "SendMessage" => {
                if self.echo_sends.load(Ordering::SeqCst) {
                    // The echo can overtake the ack
                    if let Some(payload) = args.first() {
                        self.push_event("ReceiveMessage", payload.clone());
                    }
                }
                let ts = self.server_clock.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "serverTimestamp": ts }))
            }
            other => Err(ChatError::Remote(format!("unknown method {}", other))),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.online.store(false, Ordering::SeqCst);
    }
}

pub fn record(from: &str, to: &str, text: &str, client_timestamp: i64) -> HistoryRecord {
    HistoryRecord {
        sender_id: from.to_string(),
        receiver_id: to.to_string(),
        text: text.to_string(),
        client_timestamp,
        server_timestamp: Some(client_timestamp + 1),
    }
}

/// In-memory history service
#[derive(Default)]
pub struct FakeHistory {
    conversations: Mutex<Vec<ConversationSummary>>,
    records: Mutex<HashMap<String, Vec<HistoryRecord>>>,
    pub fetches: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_conversation(&self, participant_id: &str, records: Vec<HistoryRecord>) {
        let preview = records
            .last()
            .map(|r| r.text.clone())
            .unwrap_or_default();
        self.conversations.lock().unwrap().push(ConversationSummary {
            participant_id: participant_id.to_string(),
            last_message_preview: preview,
            last_timestamp: None,
        });
        self.records
            .lock()
            .unwrap()
            .insert(participant_id.to_string(), records);
    }

    /// Replace the stored history of one conversation
    pub fn set_records(&self, participant_id: &str, records: Vec<HistoryRecord>) {
        self.records
            .lock()
            .unwrap()
            .insert(participant_id.to_string(), records);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryService for FakeHistory {
    async fn fetch_history(&self, participant_id: &str) -> Result<Vec<HistoryRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChatError::Http("history unavailable".to_string()));
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(participant_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_conversation_list(&self) -> Result<Vec<ConversationSummary>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChatError::Http("history unavailable".to_string()));
        }
        Ok(self.conversations.lock().unwrap().clone())
    }
}

/// Wait up to two seconds for a signal matching `pred`
pub async fn wait_signal<F>(
    signals: &mut broadcast::Receiver<leasechat_core::SessionSignal>,
    pred: F,
) -> Option<leasechat_core::SessionSignal>
where
    F: Fn(&leasechat_core::SessionSignal) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, signals.recv()).await {
            Ok(Ok(signal)) if pred(&signal) => return Some(signal),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}
