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

//! End-to-end tests against a real in-process hub over WebSockets.
//!
//! A teacher and a parent share a thread. Verifies:
//! 1. Delivery status advances `Sent → Delivered → Read` on the sender's side
//!    as the recipient opens and reads the thread.
//! 2. Typing signals travel through the hub between participants.
//! 3. Non-participants cannot subscribe to a thread's topics.
//! 4. The inbox summary reports unread messages.
//! 5. The connection monitor works over the real transport.
//!
//! Verification command: `cargo test --test hub_roundtrip`

use std::sync::Arc;
use std::time::Duration;

use classchat::connection::{ConnectionMonitor, ConnectionState, ReconnectConfig};
use classchat::realtime::RealtimeError;
use classchat::realtime::ws::{WsConnector, WsRealtime, WsTimeouts};
use classchat::threads::{self, ThreadError, ThreadTracker};
use classchat::typing::{TypingConfig, TypingIndicator};
use classchat_proto::message::{DeliveryStatus, MessageId, ThreadId, UserId};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Helpers
// =============================================================================

async fn start_hub() -> String {
    let (addr, _handle) = classchat_hub::hub::start_server("127.0.0.1:0")
        .await
        .unwrap();
    format!("ws://{addr}/ws")
}

async fn connect(url: &str, user: &str) -> Arc<WsRealtime> {
    Arc::new(WsRealtime::connect(url, UserId::new(user)).await.unwrap())
}

/// Creates a thread between `teacher` (the creator) and `parent`.
async fn shared_thread(teacher: &WsRealtime) -> ThreadId {
    threads::create_thread(teacher, "Field trip", vec![UserId::new("parent")])
        .await
        .unwrap()
}

/// Receives changes until `id` reaches `status`.
async fn until_status(
    tracker: &mut ThreadTracker<WsRealtime>,
    id: MessageId,
    status: DeliveryStatus,
) {
    timeout(WAIT, async {
        while tracker.message(id).map(|m| &m.status) != Some(&status) {
            tracker.receive_one().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("message never reached {status}"));
}

// =============================================================================
// Delivery tracking
// =============================================================================

#[tokio::test]
async fn delivery_status_follows_the_recipient() {
    let url = start_hub().await;
    let teacher = connect(&url, "teacher").await;
    let parent = connect(&url, "parent").await;
    let thread = shared_thread(&teacher).await;

    let mut teacher_view = ThreadTracker::open(Arc::clone(&teacher), thread, "Ms Dlamini")
        .await
        .unwrap();
    let id = teacher_view.send("Trip forms are due Friday").await.unwrap();
    assert_eq!(teacher_view.message(id).unwrap().status, DeliveryStatus::Sent);

    // Opening the thread marks the message delivered.
    let mut parent_view = ThreadTracker::open(Arc::clone(&parent), thread, "Thabo")
        .await
        .unwrap();
    assert_eq!(parent_view.messages().len(), 1);
    assert_eq!(parent_view.unread_count(), 1);
    until_status(&mut teacher_view, id, DeliveryStatus::Delivered).await;

    assert_eq!(parent_view.mark_read().await.unwrap(), 1);
    until_status(&mut teacher_view, id, DeliveryStatus::Read).await;
    assert_eq!(parent_view.unread_count(), 0);
}

#[tokio::test]
async fn live_message_is_delivered_while_thread_open() {
    let url = start_hub().await;
    let teacher = connect(&url, "teacher").await;
    let parent = connect(&url, "parent").await;
    let thread = shared_thread(&teacher).await;

    let mut teacher_view = ThreadTracker::open(Arc::clone(&teacher), thread, "Ms Dlamini")
        .await
        .unwrap();
    let mut parent_view = ThreadTracker::open(Arc::clone(&parent), thread, "Thabo")
        .await
        .unwrap();

    let id = teacher_view.send("Bus leaves at 8").await.unwrap();

    timeout(WAIT, async {
        while parent_view.message(id).is_none() {
            parent_view.receive_one().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert!(!parent_view.message(id).unwrap().outgoing);

    until_status(&mut teacher_view, id, DeliveryStatus::Delivered).await;
}

#[tokio::test]
async fn inbox_reports_unread() {
    let url = start_hub().await;
    let teacher = connect(&url, "teacher").await;
    let parent = connect(&url, "parent").await;
    let thread = shared_thread(&teacher).await;

    let mut teacher_view = ThreadTracker::open(Arc::clone(&teacher), thread, "Ms Dlamini")
        .await
        .unwrap();
    teacher_view.send("Reminder: hats").await.unwrap();

    let rows = threads::thread_summaries(parent.as_ref()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].thread_id, thread);
    assert_eq!(rows[0].unread_count, 1);
    assert_eq!(
        rows[0].last_message.as_ref().map(|m| m.text.as_str()),
        Some("Reminder: hats")
    );

    let rows = threads::thread_summaries(teacher.as_ref()).await.unwrap();
    assert_eq!(rows[0].unread_count, 0);
}

#[tokio::test]
async fn outsiders_cannot_open_thread() {
    let url = start_hub().await;
    let teacher = connect(&url, "teacher").await;
    let outsider = connect(&url, "outsider").await;
    let thread = shared_thread(&teacher).await;

    let result = ThreadTracker::open(outsider, thread, "Eve").await;
    assert!(
        matches!(
            result,
            Err(ThreadError::Realtime(RealtimeError::Rejected(_)))
        ),
        "outsider was let in"
    );
}

// =============================================================================
// Typing
// =============================================================================

#[tokio::test]
async fn typing_travels_between_participants() {
    let url = start_hub().await;
    let teacher = connect(&url, "teacher").await;
    let parent = connect(&url, "parent").await;
    let thread = shared_thread(&teacher).await;

    let teacher_typing = TypingIndicator::spawn(
        Arc::clone(&teacher),
        thread,
        "Ms Dlamini",
        TypingConfig::default(),
    )
    .await
    .unwrap();
    let parent_typing =
        TypingIndicator::spawn(Arc::clone(&parent), thread, "Thabo", TypingConfig::default())
            .await
            .unwrap();

    let mut seen = teacher_typing.changes();
    parent_typing.set_typing();
    let text = timeout(WAIT, seen.wait_for(|s| s.text.is_some()))
        .await
        .unwrap()
        .unwrap()
        .text
        .clone();
    assert_eq!(text.as_deref(), Some("Thabo is typing…"));

    parent_typing.clear_typing();
    timeout(WAIT, seen.wait_for(|s| s.text.is_none()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent_typing.typing_text(), None);
}

// =============================================================================
// Connection monitor over WebSockets
// =============================================================================

#[tokio::test]
async fn monitor_handle_carries_thread_traffic() {
    let url = start_hub().await;
    let connector = WsConnector::new(url.clone(), UserId::new("teacher"), WsTimeouts::default());
    let handle = Arc::new(ConnectionMonitor::spawn(connector, ReconnectConfig::default()));
    timeout(
        WAIT,
        handle.wait_for(|s| s.state == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    let thread = threads::create_thread(handle.as_ref(), "Sports day", vec![UserId::new("parent")])
        .await
        .unwrap();
    let mut view = ThreadTracker::open(Arc::clone(&handle), thread, "Ms Dlamini")
        .await
        .unwrap();
    let id = view.send("Sports day is on").await.unwrap();

    let parent = connect(&url, "parent").await;
    let _parent_view = ThreadTracker::open(parent, thread, "Thabo").await.unwrap();

    timeout(WAIT, async {
        while view.message(id).map(|m| &m.status) != Some(&DeliveryStatus::Delivered) {
            view.receive_one().await.unwrap();
        }
    })
    .await
    .unwrap();

    handle.shutdown();
}
