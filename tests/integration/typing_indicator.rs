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

//! Integration tests for the thread typing indicator.
//!
//! Runs real `TypingIndicator` tasks over the in-memory loopback hub with
//! tokio's paused clock, and inspects what reached the hub.
//!
//! Verifies:
//! 1. Keystrokes announce `is_typing: true` at most once per 2s window.
//! 2. Inactivity announces `is_typing: false` exactly once after 3s.
//! 3. `clear_typing` announces `false` immediately and cancels the timer.
//! 4. Remote typists appear, are named, and are swept when they go silent.
//! 5. Signals carrying the local user's id never show up locally.
//!
//! Verification command: `cargo test --test typing_indicator`

use std::sync::Arc;
use std::time::Duration;

use classchat::realtime::Realtime;
use classchat::realtime::loopback::{LoopbackHub, LoopbackRealtime};
use classchat::typing::{TypingConfig, TypingIndicator};
use classchat_proto::codec;
use classchat_proto::hub::Topic;
use classchat_proto::message::{ThreadId, Timestamp, UserId};
use classchat_proto::typing::{TYPING_EVENT, TypingSignal};

// =============================================================================
// Helpers
// =============================================================================

/// Lets spawned tasks run; paused time auto-advances while they are idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn indicator(hub: &LoopbackHub, user: &str, name: &str, thread: ThreadId) -> TypingIndicator {
    let conn = Arc::new(hub.connect(UserId::new(user)).unwrap());
    TypingIndicator::spawn(conn, thread, name, TypingConfig::default())
        .await
        .unwrap()
}

/// Typing signals `user` has sent so far, oldest first.
fn signals_from(hub: &LoopbackHub, user: &str) -> Vec<bool> {
    hub.broadcasts()
        .into_iter()
        .filter(|(from, _, event, _)| from.as_str() == user && event == TYPING_EVENT)
        .map(|(_, _, _, payload)| codec::decode::<TypingSignal>(&payload).unwrap().is_typing)
        .collect()
}

fn count(signals: &[bool], value: bool) -> usize {
    signals.iter().filter(|s| **s == value).count()
}

async fn send_signal(
    conn: &LoopbackRealtime,
    thread: ThreadId,
    user_id: &str,
    user_name: &str,
    is_typing: bool,
) {
    let signal = TypingSignal {
        user_id: UserId::new(user_id),
        user_name: user_name.into(),
        timestamp: Timestamp::now(),
        is_typing,
    };
    conn.broadcast(
        &Topic::typing(thread),
        TYPING_EVENT,
        codec::encode(&signal).unwrap(),
    )
    .await
    .unwrap();
}

// =============================================================================
// Outbound
// =============================================================================

#[tokio::test(start_paused = true)]
async fn keystrokes_announce_at_most_once_per_window() {
    let hub = LoopbackHub::new();
    let thread = ThreadId::new();
    let alice = indicator(&hub, "alice", "Alice", thread).await;

    alice.set_typing();
    settle().await;
    for _ in 0..9 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        alice.set_typing();
    }
    settle().await;
    assert_eq!(signals_from(&hub, "alice"), vec![true]);

    // Past the 2s window (and before the 3s inactivity timeout): announce again.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    alice.set_typing();
    settle().await;
    assert_eq!(signals_from(&hub, "alice"), vec![true, true]);
}

#[tokio::test(start_paused = true)]
async fn inactivity_announces_stop_exactly_once() {
    let hub = LoopbackHub::new();
    let thread = ThreadId::new();
    let alice = indicator(&hub, "alice", "Alice", thread).await;

    alice.set_typing();
    tokio::time::sleep(Duration::from_millis(2900)).await;
    assert_eq!(count(&signals_from(&hub, "alice"), false), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(signals_from(&hub, "alice"), vec![true, false]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(count(&signals_from(&hub, "alice"), false), 1);
}

#[tokio::test(start_paused = true)]
async fn clear_typing_announces_stop_immediately() {
    let hub = LoopbackHub::new();
    let thread = ThreadId::new();
    let alice = indicator(&hub, "alice", "Alice", thread).await;

    alice.set_typing();
    settle().await;
    alice.clear_typing();
    settle().await;
    assert_eq!(signals_from(&hub, "alice"), vec![true, false]);

    // The inactivity timer was cancelled, so no second stop.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(signals_from(&hub, "alice"), vec![true, false]);

    // The window was reset: the next keystroke is announced at once.
    alice.set_typing();
    settle().await;
    assert_eq!(count(&signals_from(&hub, "alice"), true), 2);
}

// =============================================================================
// Inbound
// =============================================================================

#[tokio::test(start_paused = true)]
async fn remote_typist_appears_and_clears() {
    let hub = LoopbackHub::new();
    let thread = ThreadId::new();
    let alice = indicator(&hub, "alice", "Alice", thread).await;
    let bob = indicator(&hub, "bob", "Bob", thread).await;

    alice.set_typing();
    settle().await;
    assert_eq!(bob.typing_text().as_deref(), Some("Alice is typing…"));
    assert_eq!(alice.typing_text(), None);

    alice.clear_typing();
    settle().await;
    assert_eq!(bob.typing_text(), None);
}

#[tokio::test(start_paused = true)]
async fn silent_typists_are_swept() {
    let hub = LoopbackHub::new();
    let thread = ThreadId::new();
    let bob = indicator(&hub, "bob", "Bob", thread).await;
    let carol = hub.connect(UserId::new("carol")).unwrap();
    let dave = hub.connect(UserId::new("dave")).unwrap();

    send_signal(&carol, thread, "carol", "Carol", true).await;
    send_signal(&dave, thread, "dave", "Dave", true).await;
    settle().await;
    assert_eq!(bob.typing_text().as_deref(), Some("Carol and Dave are typing…"));

    // Neither sends `false`; both vanish once timeout + grace has passed.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(bob.typing_text().is_some());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(bob.typing_text(), None);
    assert!(bob.snapshot().users.is_empty());
}

#[tokio::test(start_paused = true)]
async fn signals_carrying_own_id_are_ignored() {
    let hub = LoopbackHub::new();
    let thread = ThreadId::new();
    let bob = indicator(&hub, "bob", "Bob", thread).await;
    let carol = hub.connect(UserId::new("carol")).unwrap();

    send_signal(&carol, thread, "bob", "Bob", true).await;
    settle().await;
    assert_eq!(bob.typing_text(), None);
}

#[tokio::test(start_paused = true)]
async fn dropping_indicator_unsubscribes() {
    let hub = LoopbackHub::new();
    let thread = ThreadId::new();
    let alice = indicator(&hub, "alice", "Alice", thread).await;
    let topic = alice.topic().clone();
    assert_eq!(hub.subscribers(&topic), vec![UserId::new("alice")]);

    drop(alice);
    settle().await;
    assert!(hub.subscribers(&topic).is_empty());
}
