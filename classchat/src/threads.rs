//! Message delivery tracking for an open thread.
//!
//! [`ThreadTracker`] keeps the local view of one thread in sync with the hub:
//! it loads the history, subscribes the thread's row-change topic, marks
//! inbound messages delivered as they arrive, and advances the delivery
//! status of the user's own messages (`Pending → Sent → Delivered → Read`).
//! Status never moves backwards.

use std::sync::Arc;

use classchat_proto::hub::{RpcCall, RpcResponse, ThreadChange, Topic};
use classchat_proto::message::{
    self, DeliveryStatus, MessageId, ThreadId, ThreadMessage, Timestamp, UserId, ValidationError,
};
use classchat_proto::thread::ThreadSummary;

use crate::realtime::{InboundEvent, Realtime, RealtimeError, Subscription};

/// Errors surfaced by thread operations.
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    /// The message body was rejected locally.
    #[error("invalid message: {0}")]
    Invalid(#[from] ValidationError),

    /// The hub could not be reached or refused the request.
    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    /// The hub answered with a response of the wrong shape.
    #[error("unexpected reply from hub: {0}")]
    UnexpectedReply(String),

    /// The thread's change subscription ended.
    #[error("thread subscription closed")]
    Closed,

    /// No local message with this id.
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
}

fn unexpected(reply: &RpcResponse) -> ThreadError {
    ThreadError::UnexpectedReply(format!("{reply:?}"))
}

/// Local projection of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    /// Message id (shared by the optimistic copy and the stored row).
    pub id: MessageId,
    /// Author.
    pub sender_id: UserId,
    /// Author's display name.
    pub sender_name: String,
    /// Text.
    pub body: String,
    /// Hub time once stored, local time while pending.
    pub created_at: Timestamp,
    /// Whether the local user wrote it.
    pub outgoing: bool,
    /// Delivery status.
    pub status: DeliveryStatus,
}

impl MessageView {
    fn from_row(row: &ThreadMessage, local: &UserId) -> Self {
        let outgoing = row.sender_id == *local;
        let status = if outgoing {
            row.delivery_status()
        } else if row.read_at.is_some() {
            DeliveryStatus::Read
        } else {
            DeliveryStatus::Delivered
        };
        Self {
            id: row.id,
            sender_id: row.sender_id.clone(),
            sender_name: row.sender_name.clone(),
            body: row.body.clone(),
            created_at: row.created_at,
            outgoing,
            status,
        }
    }

    /// Moves the status forward; never backwards.
    fn advance(&mut self, status: DeliveryStatus) -> bool {
        if status.rank() > self.status.rank() {
            self.status = status;
            true
        } else {
            false
        }
    }
}

/// Something visible changed in the tracked thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadEvent {
    /// A message appeared.
    MessageAdded(MessageId),
    /// A message's delivery status changed.
    StatusChanged {
        /// Which message.
        id: MessageId,
        /// Its new status.
        status: DeliveryStatus,
    },
}

/// Delivery tracking for one open thread.
pub struct ThreadTracker<R: Realtime> {
    realtime: Arc<R>,
    thread_id: ThreadId,
    user_name: String,
    subscription: Subscription,
    messages: Vec<MessageView>,
    delivery_mark_pending: bool,
}

impl<R: Realtime> ThreadTracker<R> {
    /// Subscribes `thread:{thread_id}`, loads the history and marks inbound
    /// messages delivered.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::Realtime`] if subscribing, listing or marking
    /// fails.
    pub async fn open(
        realtime: Arc<R>,
        thread_id: ThreadId,
        user_name: impl Into<String>,
    ) -> Result<Self, ThreadError> {
        let subscription = realtime.subscribe(&Topic::thread(thread_id)).await?;
        let rows = match realtime.call(RpcCall::ListMessages { thread_id }).await? {
            RpcResponse::Messages(rows) => rows,
            other => return Err(unexpected(&other)),
        };

        let local = realtime.local_id().clone();
        let needs_mark = rows
            .iter()
            .any(|r| r.sender_id != local && r.delivered_at.is_none());
        let messages = rows.iter().map(|r| MessageView::from_row(r, &local)).collect();

        let tracker = Self {
            realtime,
            thread_id,
            user_name: user_name.into(),
            subscription,
            messages,
            delivery_mark_pending: false,
        };
        if needs_mark {
            tracker.mark_delivered().await?;
        }
        tracing::debug!(thread = %thread_id, messages = tracker.messages.len(), "thread opened");
        Ok(tracker)
    }

    /// The tracked thread.
    #[must_use]
    pub const fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[MessageView] {
        &self.messages
    }

    /// Looks up one message.
    #[must_use]
    pub fn message(&self, id: MessageId) -> Option<&MessageView> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Inbound messages the local user has not read.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.outgoing && m.status != DeliveryStatus::Read)
            .count()
    }

    /// Sends a message. An optimistic `Pending` copy is shown at once; it
    /// becomes `Sent` when the hub stores it or `Failed` if the post fails.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::Invalid`] (nothing is added) for a blank or
    /// oversized body, or the post error (the copy is marked failed).
    pub async fn send(&mut self, body: &str) -> Result<MessageId, ThreadError> {
        message::validate_body(body)?;
        let id = MessageId::new();
        self.messages.push(MessageView {
            id,
            sender_id: self.realtime.local_id().clone(),
            sender_name: self.user_name.clone(),
            body: body.to_string(),
            created_at: Timestamp::now(),
            outgoing: true,
            status: DeliveryStatus::Pending,
        });
        self.post(id, body.to_string()).await?;
        Ok(id)
    }

    /// Re-posts a failed message under the same id.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::UnknownMessage`] if `id` is not a local
    /// message, or the post error.
    pub async fn resend(&mut self, id: MessageId) -> Result<(), ThreadError> {
        let body = self
            .messages
            .iter_mut()
            .find(|m| m.id == id && m.outgoing)
            .map(|m| {
                if matches!(m.status, DeliveryStatus::Failed(_)) {
                    m.status = DeliveryStatus::Pending;
                }
                m.body.clone()
            })
            .ok_or(ThreadError::UnknownMessage(id))?;
        self.post(id, body).await
    }

    async fn post(&mut self, id: MessageId, body: String) -> Result<(), ThreadError> {
        let call = RpcCall::PostMessage {
            thread_id: self.thread_id,
            message_id: id,
            sender_name: self.user_name.clone(),
            body,
        };
        match self.realtime.call(call).await {
            Ok(RpcResponse::Posted(row)) => {
                self.merge_row(&row);
                Ok(())
            }
            Ok(other) => {
                let err = unexpected(&other);
                self.fail(id, &err);
                Err(err)
            }
            Err(e) => {
                tracing::warn!(thread = %self.thread_id, message = %id, err = %e, "send failed");
                let err = ThreadError::from(e);
                self.fail(id, &err);
                Err(err)
            }
        }
    }

    fn fail(&mut self, id: MessageId, err: &ThreadError) {
        if let Some(view) = self.messages.iter_mut().find(|m| m.id == id)
            && view.status == DeliveryStatus::Pending
        {
            view.status = DeliveryStatus::Failed(err.to_string());
        }
    }

    /// Waits for the next change on the thread topic and applies it, then
    /// marks any new inbound message delivered.
    ///
    /// A failure to mark is logged and does not lose the message.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::Closed`] once the subscription ends.
    pub async fn receive_one(&mut self) -> Result<Vec<ThreadEvent>, ThreadError> {
        let events = self.next_change().await?;
        self.flush_delivered().await;
        Ok(events)
    }

    /// Waits for the next change and applies it without any network call.
    ///
    /// Cancel safe; inbound messages are remembered for
    /// [`flush_delivered`](Self::flush_delivered).
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::Closed`] once the subscription ends.
    pub async fn next_change(&mut self) -> Result<Vec<ThreadEvent>, ThreadError> {
        let event = self.subscription.recv().await.ok_or(ThreadError::Closed)?;
        let InboundEvent::Change(change) = event else {
            return Ok(Vec::new());
        };
        let (events, inbound) = self.apply_change(change);
        self.delivery_mark_pending |= inbound;
        Ok(events)
    }

    /// Sends the delivery mark owed for inbound messages, if any.
    pub async fn flush_delivered(&mut self) {
        if !self.delivery_mark_pending {
            return;
        }
        match self.mark_delivered().await {
            Ok(_) => self.delivery_mark_pending = false,
            Err(e) => {
                tracing::warn!(thread = %self.thread_id, err = %e, "mark delivered failed");
            }
        }
    }

    /// Reloads the history after a reconnect and folds in anything missed.
    ///
    /// # Errors
    ///
    /// Returns the RPC error or [`ThreadError::UnexpectedReply`].
    pub async fn reload(&mut self) -> Result<Vec<ThreadEvent>, ThreadError> {
        let rows = match self
            .realtime
            .call(RpcCall::ListMessages {
                thread_id: self.thread_id,
            })
            .await?
        {
            RpcResponse::Messages(rows) => rows,
            other => return Err(unexpected(&other)),
        };
        let mut events = Vec::new();
        for row in rows {
            let (mut applied, inbound) = self.apply_change(ThreadChange::MessageInserted(row));
            self.delivery_mark_pending |= inbound;
            events.append(&mut applied);
        }
        self.flush_delivered().await;
        Ok(events)
    }

    /// Marks every inbound message read.
    ///
    /// Returns how many local messages changed.
    ///
    /// # Errors
    ///
    /// Returns the RPC error; local state is left untouched in that case.
    pub async fn mark_read(&mut self) -> Result<usize, ThreadError> {
        let reply = self
            .realtime
            .call(RpcCall::MarkMessagesRead {
                thread_id: self.thread_id,
            })
            .await?;
        if !matches!(reply, RpcResponse::Marked(_)) {
            return Err(unexpected(&reply));
        }
        let changed = self
            .messages
            .iter_mut()
            .filter(|m| !m.outgoing)
            .map(|m| m.advance(DeliveryStatus::Read))
            .filter(|changed| *changed)
            .count();
        Ok(changed)
    }

    /// Leaves the thread, unsubscribing its change topic on the hub.
    ///
    /// # Errors
    ///
    /// Returns [`ThreadError::Realtime`] if the hub refuses the unsubscribe.
    /// An already closed connection is not an error.
    pub async fn close(self) -> Result<(), ThreadError> {
        match self.realtime.unsubscribe(self.subscription.topic()).await {
            Ok(()) | Err(RealtimeError::ConnectionClosed) => {
                tracing::debug!(thread = %self.thread_id, "thread closed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_delivered(&self) -> Result<Vec<MessageId>, ThreadError> {
        match self
            .realtime
            .call(RpcCall::MarkMessagesDelivered {
                thread_id: self.thread_id,
            })
            .await?
        {
            RpcResponse::Marked(ids) => Ok(ids),
            other => Err(unexpected(&other)),
        }
    }

    /// Applies a change; the flag reports whether an inbound message arrived.
    fn apply_change(&mut self, change: ThreadChange) -> (Vec<ThreadEvent>, bool) {
        let local = self.realtime.local_id().clone();
        let mut events = Vec::new();
        let mut inbound = false;

        match change {
            ThreadChange::MessageInserted(row) => {
                if row.thread_id != self.thread_id {
                    return (events, false);
                }
                if self.messages.iter().any(|m| m.id == row.id) {
                    if let Some(event) = self.merge_row(&row) {
                        events.push(event);
                    }
                } else {
                    let view = MessageView::from_row(&row, &local);
                    inbound = !view.outgoing;
                    events.push(ThreadEvent::MessageAdded(view.id));
                    self.messages.push(view);
                }
            }
            ThreadChange::MessagesDelivered {
                recipient,
                message_ids,
                ..
            } if recipient != local => {
                self.advance_own(&message_ids, &DeliveryStatus::Delivered, &mut events);
            }
            ThreadChange::MessagesRead {
                recipient,
                message_ids,
                ..
            } => {
                // Our own reads (from another device) mark inbound messages.
                let outgoing = recipient != local;
                for view in &mut self.messages {
                    if view.outgoing == outgoing
                        && message_ids.contains(&view.id)
                        && view.advance(DeliveryStatus::Read)
                    {
                        events.push(ThreadEvent::StatusChanged {
                            id: view.id,
                            status: DeliveryStatus::Read,
                        });
                    }
                }
            }
            ThreadChange::MessagesDelivered { .. } => {}
        }
        (events, inbound)
    }

    fn advance_own(
        &mut self,
        ids: &[MessageId],
        status: &DeliveryStatus,
        events: &mut Vec<ThreadEvent>,
    ) {
        for view in &mut self.messages {
            if view.outgoing && ids.contains(&view.id) && view.advance(status.clone()) {
                events.push(ThreadEvent::StatusChanged {
                    id: view.id,
                    status: status.clone(),
                });
            }
        }
    }

    /// Folds a stored row into the local copy with the same id.
    fn merge_row(&mut self, row: &ThreadMessage) -> Option<ThreadEvent> {
        let view = self.messages.iter_mut().find(|m| m.id == row.id)?;
        view.created_at = row.created_at;
        if !view.outgoing {
            return None;
        }
        let status = row.delivery_status();
        view.advance(status.clone())
            .then_some(ThreadEvent::StatusChanged { id: view.id, status })
    }
}

/// Inbox rows for the connected user, most recently active first.
///
/// # Errors
///
/// Returns the RPC error or [`ThreadError::UnexpectedReply`].
pub async fn thread_summaries<R: Realtime>(
    realtime: &R,
) -> Result<Vec<ThreadSummary>, ThreadError> {
    match realtime.call(RpcCall::ThreadsSummary).await? {
        RpcResponse::Summaries(rows) => Ok(rows),
        other => Err(unexpected(&other)),
    }
}

/// Creates a thread with the connected user and `participants`.
///
/// # Errors
///
/// Returns the RPC error (e.g. a blank subject) or
/// [`ThreadError::UnexpectedReply`].
pub async fn create_thread<R: Realtime>(
    realtime: &R,
    subject: &str,
    participants: Vec<UserId>,
) -> Result<ThreadId, ThreadError> {
    let call = RpcCall::CreateThread {
        subject: subject.to_string(),
        participants,
    };
    match realtime.call(call).await? {
        RpcResponse::ThreadCreated(id) => Ok(id),
        other => Err(unexpected(&other)),
    }
}
