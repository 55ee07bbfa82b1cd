// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for the connection monitor's reconnect behaviour.
//!
//! Drives `ConnectionMonitor` against the loopback hub with tokio's paused
//! clock, so backoff delays are exact and instantaneous.
//!
//! Verifies:
//! - a dropped connection reconnects after the backoff delay
//! - subscriptions made through the handle survive reconnects
//! - delays double per attempt and the monitor goes offline after
//!   `max_attempts`, making no further attempts
//! - `retry` and `foreground` leave the backoff wait or offline state
//!
//! Verification command: `cargo test --test reconnect`

use std::sync::Arc;
use std::time::Duration;

use classchat::connection::{
    ConnectionHandle, ConnectionMonitor, ConnectionState, ReconnectConfig,
};
use classchat::realtime::loopback::{LoopbackConnector, LoopbackHub, LoopbackRealtime};
use classchat::realtime::{InboundEvent, Realtime};
use classchat::typing::{TypingConfig, TypingIndicator};
use classchat_proto::codec;
use classchat_proto::hub::Topic;
use classchat_proto::message::{ThreadId, Timestamp, UserId};
use classchat_proto::typing::{TYPING_EVENT, TypingSignal};
use tokio::time::Instant;

// =============================================================================
// Helpers
// =============================================================================

fn config(max_attempts: Option<u32>) -> ReconnectConfig {
    ReconnectConfig {
        max_attempts,
        ..ReconnectConfig::default()
    }
}

fn spawn(
    hub: &LoopbackHub,
    user: &str,
    cfg: ReconnectConfig,
) -> ConnectionHandle<LoopbackRealtime> {
    ConnectionMonitor::spawn(LoopbackConnector::new(hub.clone(), UserId::new(user)), cfg)
}

async fn wait_state(handle: &ConnectionHandle<LoopbackRealtime>, state: ConnectionState) {
    handle.wait_for(|s| s.state == state).await.unwrap();
}

// =============================================================================
// Reconnect
// =============================================================================

#[tokio::test(start_paused = true)]
async fn dropped_connection_reconnects_after_backoff() {
    let hub = LoopbackHub::new();
    let handle = spawn(&hub, "alice", config(None));
    wait_state(&handle, ConnectionState::Connected).await;

    let lost_at = Instant::now();
    hub.disconnect(&UserId::new("alice"));

    let status = handle
        .wait_for(|s| s.state == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert_eq!(status.retry_in, Some(Duration::from_secs(1)));
    assert!(!handle.is_connected());

    let status = handle
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .unwrap();
    assert!(lost_at.elapsed() >= Duration::from_secs(1));
    assert_eq!(status.attempt, 0);
    assert_eq!(hub.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn subscriptions_survive_reconnect() {
    let hub = LoopbackHub::new();
    let handle = spawn(&hub, "alice", config(None));
    wait_state(&handle, ConnectionState::Connected).await;

    let lobby = Topic::new("lobby");
    let mut sub = handle.subscribe(&lobby).await.unwrap();
    let bob = hub.connect(UserId::new("bob")).unwrap();

    hub.disconnect(&UserId::new("alice"));
    wait_state(&handle, ConnectionState::Disconnected).await;
    wait_state(&handle, ConnectionState::Connected).await;

    bob.broadcast(&lobby, "wave", vec![1]).await.unwrap();
    match sub.recv().await.unwrap() {
        InboundEvent::Broadcast { from, event, payload } => {
            assert_eq!(from, UserId::new("bob"));
            assert_eq!(event, "wave");
            assert_eq!(payload, vec![1]);
        }
        other => panic!("expected broadcast, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn subscribe_while_disconnected_is_deferred() {
    let hub = LoopbackHub::new();
    hub.set_available(false);
    let handle = spawn(&hub, "alice", config(None));
    wait_state(&handle, ConnectionState::Disconnected).await;

    let lobby = Topic::new("lobby");
    let mut sub = handle.subscribe(&lobby).await.unwrap();
    assert!(hub.subscribers(&lobby).is_empty());

    hub.set_available(true);
    wait_state(&handle, ConnectionState::Connected).await;
    assert_eq!(hub.subscribers(&lobby), vec![UserId::new("alice")]);

    let bob = hub.connect(UserId::new("bob")).unwrap();
    bob.broadcast(&lobby, "wave", vec![]).await.unwrap();
    assert!(matches!(
        sub.recv().await,
        Some(InboundEvent::Broadcast { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_keeps_working_across_reconnect() {
    let hub = LoopbackHub::new();
    let handle = Arc::new(spawn(&hub, "alice", config(None)));
    wait_state(&handle, ConnectionState::Connected).await;

    let thread = ThreadId::new();
    let typing = TypingIndicator::spawn(
        Arc::clone(&handle),
        thread,
        "Alice",
        TypingConfig::default(),
    )
    .await
    .unwrap();

    hub.disconnect(&UserId::new("alice"));
    wait_state(&handle, ConnectionState::Disconnected).await;
    wait_state(&handle, ConnectionState::Connected).await;

    let bob = hub.connect(UserId::new("bob")).unwrap();
    let signal = TypingSignal {
        user_id: UserId::new("bob"),
        user_name: "Bob".into(),
        timestamp: Timestamp::now(),
        is_typing: true,
    };
    bob.broadcast(
        &Topic::typing(thread),
        TYPING_EVENT,
        codec::encode(&signal).unwrap(),
    )
    .await
    .unwrap();

    let mut changes = typing.changes();
    let snapshot = changes
        .wait_for(|s| s.text.is_some())
        .await
        .unwrap()
        .clone();
    assert_eq!(snapshot.text.as_deref(), Some("Bob is typing…"));
}

// =============================================================================
// Backoff and offline
// =============================================================================

#[tokio::test(start_paused = true)]
async fn delays_double_until_offline() {
    let hub = LoopbackHub::new();
    hub.set_available(false);
    let handle = spawn(&hub, "alice", config(Some(3)));

    let mut rx = handle.watch_status();
    let mut delays = Vec::new();
    loop {
        let status = *rx.borrow_and_update();
        if status.state == ConnectionState::Disconnected
            && let Some(delay) = status.retry_in
            && delays.last() != Some(&delay)
        {
            delays.push(delay);
        }
        if status.state == ConnectionState::Offline {
            break;
        }
        rx.changed().await.unwrap();
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
    // The initial connect plus three reconnects.
    assert_eq!(hub.connect_attempts(), 4);

    // Offline is terminal until asked: no more attempts, however long we wait.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(handle.status().state, ConnectionState::Offline);
    assert_eq!(hub.connect_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn retry_leaves_offline() {
    let hub = LoopbackHub::new();
    hub.set_available(false);
    let handle = spawn(&hub, "alice", config(Some(1)));
    wait_state(&handle, ConnectionState::Offline).await;

    hub.set_available(true);
    handle.retry();
    let status = handle
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .unwrap();
    assert_eq!(status.attempt, 0);
}

#[tokio::test(start_paused = true)]
async fn foreground_skips_backoff_wait() {
    let hub = LoopbackHub::new();
    hub.set_available(false);
    let handle = spawn(&hub, "alice", ReconnectConfig {
        initial_delay: Duration::from_secs(20),
        ..config(None)
    });
    wait_state(&handle, ConnectionState::Disconnected).await;

    let started = Instant::now();
    hub.set_available(true);
    handle.foreground();
    wait_state(&handle, ConnectionState::Connected).await;
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn foreground_while_connected_reuses_connection() {
    let hub = LoopbackHub::new();
    let handle = spawn(&hub, "alice", config(None));
    wait_state(&handle, ConnectionState::Connected).await;
    assert_eq!(hub.connect_attempts(), 1);

    let probe = Topic::connection(&UserId::new("alice"));
    assert_eq!(hub.subscribe_calls(&probe), 1);
    assert_eq!(hub.unsubscribe_calls(&probe), 0);

    let mut rx = handle.watch_status();
    rx.borrow_and_update();
    handle.foreground();

    // The monitor publishes Connecting before it is Connected again.
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow_and_update().state, ConnectionState::Connecting);
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow_and_update().state, ConnectionState::Connected);

    // One unsubscribe/resubscribe cycle on the same connection.
    assert_eq!(hub.unsubscribe_calls(&probe), 1);
    assert_eq!(hub.subscribe_calls(&probe), 2);
    assert_eq!(hub.connect_attempts(), 1);
    assert_eq!(hub.subscribers(&probe), vec![UserId::new("alice")]);
}
