/// Connection session lifecycle tests against an in-memory transport
mod common;

use common::{eventually, test_config, wait_signal, FakeTransport};
use leasechat_core::{
    ChatError, ChatMessage, ConnectionSession, Origin, SessionSignal, SessionState,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

fn session_for(user: &str, transport: &Arc<FakeTransport>) -> ConnectionSession {
    ConnectionSession::new(user, transport.clone(), &test_config(user))
}

fn collect(session: &ConnectionSession) -> Arc<Mutex<Vec<ChatMessage>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    session.on_message(move |message| sink.lock().unwrap().push(message));
    received
}

fn outgoing(from: &str, to: &str, text: &str, ts: i64) -> ChatMessage {
    ChatMessage::new(from, to, text, ts, Origin::Local).unwrap()
}

#[tokio::test]
async fn test_connect_joins_user_channel() {
    let transport = FakeTransport::new();
    let session = session_for("tenant-7", &transport);
    let mut signals = session.signals();
    assert_eq!(session.user_id(), "tenant-7");
    assert_eq!(session.state().await, SessionState::Idle);

    session.connect().await.unwrap();

    assert_eq!(session.state().await, SessionState::Joined);
    assert_eq!(transport.starts.load(Ordering::SeqCst), 1);
    assert_eq!(
        transport.last_args("JoinChat"),
        Some(vec![json!("tenant-7")])
    );
    assert!(wait_signal(&mut signals, |s| *s == SessionSignal::Joined)
        .await
        .is_some());
}

#[tokio::test]
async fn test_connect_is_noop_when_joined() {
    let transport = FakeTransport::new();
    let session = session_for("tenant-7", &transport);

    session.connect().await.unwrap();
    session.connect().await.unwrap();

    assert_eq!(transport.starts.load(Ordering::SeqCst), 1);
    assert_eq!(transport.calls_to("JoinChat"), 1);
    assert_eq!(session.state().await, SessionState::Joined);
}

#[tokio::test]
async fn test_start_failure_returns_to_idle() {
    let transport = FakeTransport::new();
    transport.fail_start.store(true, Ordering::SeqCst);
    let session = session_for("tenant-7", &transport);
    let mut signals = session.signals();

    let result = session.connect().await;
    assert!(matches!(result, Err(ChatError::ConnectFailed(_))));
    assert_eq!(session.state().await, SessionState::Idle);
    assert!(wait_signal(&mut signals, |s| matches!(
        s,
        SessionSignal::ConnectFailed { .. }
    ))
    .await
    .is_some());
    assert_eq!(transport.calls_to("JoinChat"), 0);

    // Retrying after the failure is allowed
    transport.fail_start.store(false, Ordering::SeqCst);
    session.connect().await.unwrap();
    assert_eq!(session.state().await, SessionState::Joined);
}

#[tokio::test]
async fn test_join_rejection_stops_transport() {
    let transport = FakeTransport::new();
    transport.fail_join.store(true, Ordering::SeqCst);
    let session = session_for("tenant-7", &transport);

    let result = session.connect().await;
    match result {
        Err(ChatError::ConnectFailed(reason)) => assert!(reason.contains("join rejected")),
        other => panic!("unexpected connect result: {:?}", other),
    }
    assert_eq!(session.state().await, SessionState::Idle);
    assert!(transport.stops.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_send_requires_joined_channel() {
    let transport = FakeTransport::new();
    let session = session_for("tenant-7", &transport);
    let message = outgoing("tenant-7", "landlord-1", "Is the heating fixed?", 1000);

    assert!(matches!(
        session.send(&message).await,
        Err(ChatError::NotConnected)
    ));
    assert_eq!(transport.calls_to("SendMessage"), 0);

    session.connect().await.unwrap();
    let receipt = session.send(&message).await.unwrap();
    assert_eq!(receipt.server_timestamp, 50_000);

    let args = transport.last_args("SendMessage").unwrap();
    assert_eq!(args[0]["senderId"], "tenant-7");
    assert_eq!(args[0]["receiverId"], "landlord-1");
    assert_eq!(args[0]["text"], "Is the heating fixed?");
    assert_eq!(args[0]["clientTimestamp"], 1000);
}

#[tokio::test]
async fn test_drop_and_rejoin() {
    let transport = FakeTransport::new();
    let session = session_for("tenant-7", &transport);
    let mut signals = session.signals();
    session.connect().await.unwrap();

    transport.drop_connection();
    assert!(wait_signal(&mut signals, |s| *s == SessionSignal::Reconnecting)
        .await
        .is_some());
    assert_eq!(session.state().await, SessionState::Reconnecting);

    // Sends are refused until the channel is re-joined
    let message = outgoing("tenant-7", "landlord-1", "hello?", 2000);
    assert!(matches!(
        session.send(&message).await,
        Err(ChatError::NotConnected)
    ));

    transport.restore();
    assert!(wait_signal(&mut signals, |s| *s == SessionSignal::Joined)
        .await
        .is_some());
    assert_eq!(session.state().await, SessionState::Joined);
    assert_eq!(transport.calls_to("JoinChat"), 2);
    assert!(session.send(&message).await.is_ok());
}

#[tokio::test]
async fn test_messages_delivered_to_handlers() {
    let transport = FakeTransport::new();
    let session = session_for("tenant-7", &transport);
    let first = collect(&session);
    let second = collect(&session);
    session.connect().await.unwrap();

    transport.push_message("landlord-1", "tenant-7", "  Rent is due Friday ", 3000);

    assert!(eventually(|| first.lock().unwrap().len() == 1).await);
    assert!(eventually(|| second.lock().unwrap().len() == 1).await);
    let message = first.lock().unwrap()[0].clone();
    assert_eq!(message.text(), "Rent is due Friday");
    assert_eq!(message.origin(), Origin::Live);
    assert_eq!(message.sender_id(), "landlord-1");
}

#[tokio::test]
async fn test_malformed_and_unknown_events_are_dropped() {
    let transport = FakeTransport::new();
    let session = session_for("tenant-7", &transport);
    let received = collect(&session);
    session.connect().await.unwrap();

    transport.push_event("ReceiveMessage", json!({ "text": "no ids" }));
    transport.push_message("landlord-1", "tenant-7", "   ", 1);
    transport.push_event("UserTyping", json!({ "userId": "landlord-1" }));
    transport.push_message("landlord-1", "tenant-7", "still here", 2);

    assert!(eventually(|| received.lock().unwrap().len() == 1).await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].text(), "still here");
}

#[tokio::test]
async fn test_messages_delivered_while_reconnecting() {
    let transport = FakeTransport::new();
    let session = session_for("tenant-7", &transport);
    let mut signals = session.signals();
    let received = collect(&session);
    session.connect().await.unwrap();

    transport.drop_connection();
    wait_signal(&mut signals, |s| *s == SessionSignal::Reconnecting).await;
    transport.push_message("landlord-1", "tenant-7", "late delivery", 4000);

    assert!(eventually(|| received.lock().unwrap().len() == 1).await);
}

#[tokio::test]
async fn test_removed_handler_stops_receiving() {
    let transport = FakeTransport::new();
    let session = session_for("tenant-7", &transport);
    let kept = collect(&session);

    let removed = Arc::new(Mutex::new(0usize));
    let counter = removed.clone();
    let id = session.on_message(move |_| *counter.lock().unwrap() += 1);
    assert!(session.remove_handler(id));
    assert!(!session.remove_handler(id));

    session.connect().await.unwrap();
    transport.push_message("landlord-1", "tenant-7", "hi", 5000);

    assert!(eventually(|| kept.lock().unwrap().len() == 1).await);
    assert_eq!(*removed.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_close_is_terminal() {
    let transport = FakeTransport::new();
    let session = session_for("tenant-7", &transport);
    let mut signals = session.signals();
    let received = collect(&session);
    session.connect().await.unwrap();

    session.close().await;
    session.close().await;

    assert_eq!(session.state().await, SessionState::Closed);
    assert_eq!(transport.stops.load(Ordering::SeqCst), 1);
    assert!(wait_signal(&mut signals, |s| *s == SessionSignal::Closed)
        .await
        .is_some());

    transport.push_message("landlord-1", "tenant-7", "anyone?", 6000);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(received.lock().unwrap().is_empty());

    assert!(matches!(
        session.connect().await,
        Err(ChatError::AlreadyClosed)
    ));
    let message = outgoing("tenant-7", "landlord-1", "bye", 7000);
    assert!(matches!(
        session.send(&message).await,
        Err(ChatError::AlreadyClosed)
    ));
}

#[tokio::test]
async fn test_transport_give_up_returns_to_idle() {
    let transport = FakeTransport::new();
    let session = session_for("tenant-7", &transport);
    let mut signals = session.signals();
    session.connect().await.unwrap();

    transport.drop_connection();
    wait_signal(&mut signals, |s| *s == SessionSignal::Reconnecting).await;
    transport.give_up();

    assert!(wait_signal(&mut signals, |s| matches!(
        s,
        SessionSignal::ConnectFailed { .. }
    ))
    .await
    .is_some());
    assert_eq!(session.state().await, SessionState::Idle);

    // The caller may start over
    session.connect().await.unwrap();
    assert_eq!(session.state().await, SessionState::Joined);
}
