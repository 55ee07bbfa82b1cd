//! Hub wire protocol types.
//!
//! Defines the [`HubMessage`] enum that is postcard-encoded and sent over
//! WebSocket binary frames between clients and the realtime hub, plus the
//! topic naming scheme and the RPC call/response shapes.

use serde::{Deserialize, Serialize};

use crate::message::{MessageId, ThreadId, ThreadMessage, Timestamp, UserId};
use crate::thread::ThreadSummary;

const TYPING_PREFIX: &str = "typing:";
const THREAD_PREFIX: &str = "thread:";
const CONNECTION_PREFIX: &str = "connection:";

/// Name of a publish/subscribe channel on the hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    /// Creates a topic from a raw name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Broadcast channel carrying typing signals for a thread.
    #[must_use]
    pub fn typing(thread_id: ThreadId) -> Self {
        Self(format!("{TYPING_PREFIX}{thread_id}"))
    }

    /// Channel carrying row changes (inserts, delivery marks) for a thread.
    #[must_use]
    pub fn thread(thread_id: ThreadId) -> Self {
        Self(format!("{THREAD_PREFIX}{thread_id}"))
    }

    /// Lightweight probe channel used to observe connection health.
    #[must_use]
    pub fn connection(user_id: &UserId) -> Self {
        Self(format!("{CONNECTION_PREFIX}{user_id}"))
    }

    /// The thread this topic is scoped to, for `typing:` and `thread:` topics.
    #[must_use]
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.0
            .strip_prefix(TYPING_PREFIX)
            .or_else(|| self.0.strip_prefix(THREAD_PREFIX))
            .and_then(|rest| rest.parse().ok())
    }

    /// The user a `connection:` probe topic belongs to.
    #[must_use]
    pub fn probe_owner(&self) -> Option<&str> {
        self.0.strip_prefix(CONNECTION_PREFIX)
    }

    /// Returns the topic name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named hub procedures callable by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcCall {
    /// Create a thread; the caller is always added as a participant.
    CreateThread {
        /// Subject line.
        subject: String,
        /// Other participants.
        participants: Vec<UserId>,
    },
    /// Store a message in a thread.
    PostMessage {
        /// Target thread.
        thread_id: ThreadId,
        /// Client-chosen id; re-posting the same id is idempotent.
        message_id: MessageId,
        /// Display name of the author.
        sender_name: String,
        /// Message text.
        body: String,
    },
    /// Fetch every stored message of a thread, oldest first.
    ListMessages {
        /// Thread to list.
        thread_id: ThreadId,
    },
    /// Mark messages from other participants as delivered to the caller.
    MarkMessagesDelivered {
        /// Thread to mark.
        thread_id: ThreadId,
    },
    /// Mark messages from other participants as read by the caller.
    MarkMessagesRead {
        /// Thread to mark.
        thread_id: ThreadId,
    },
    /// Inbox view: one summary per thread the caller participates in.
    ThreadsSummary,
}

/// Successful RPC results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    /// Reply to [`RpcCall::CreateThread`].
    ThreadCreated(ThreadId),
    /// Reply to [`RpcCall::PostMessage`].
    Posted(ThreadMessage),
    /// Reply to [`RpcCall::ListMessages`].
    Messages(Vec<ThreadMessage>),
    /// Reply to the mark calls: the messages whose state changed.
    Marked(Vec<MessageId>),
    /// Reply to [`RpcCall::ThreadsSummary`].
    Summaries(Vec<ThreadSummary>),
}

/// Reasons an RPC can be rejected by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RpcFailure {
    /// No thread with the given id exists.
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    /// The caller is not a participant of the thread.
    #[error("not a participant of thread {0}")]
    NotParticipant(ThreadId),
    /// The call arguments were rejected.
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// Row changes pushed to subscribers of a `thread:` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadChange {
    /// A new message was stored.
    MessageInserted(ThreadMessage),
    /// A recipient received some messages.
    MessagesDelivered {
        /// Thread the messages belong to.
        thread_id: ThreadId,
        /// The recipient whose client marked them.
        recipient: UserId,
        /// Messages that moved to delivered.
        message_ids: Vec<MessageId>,
        /// When they were marked.
        at: Timestamp,
    },
    /// A recipient read some messages.
    MessagesRead {
        /// Thread the messages belong to.
        thread_id: ThreadId,
        /// The recipient who read them.
        recipient: UserId,
        /// Messages that moved to read.
        message_ids: Vec<MessageId>,
        /// When they were marked.
        at: Timestamp,
    },
}

/// Messages exchanged between clients and the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubMessage {
    /// Client announces its identity.
    ///
    /// Must be the first message sent after the WebSocket connection opens.
    /// The hub responds with [`HubMessage::Welcome`] on success.
    Hello {
        /// Identity of the connecting user.
        client_id: UserId,
    },

    /// Hub acknowledges the hello (echoes the id back).
    Welcome {
        /// The registered identity.
        client_id: UserId,
    },

    /// Join a topic.
    Subscribe {
        /// Topic to join.
        topic: Topic,
    },

    /// Hub acknowledges a subscription.
    Subscribed {
        /// Topic that was joined.
        topic: Topic,
    },

    /// Hub refuses a subscription (not a participant, topic limit reached).
    Refused {
        /// Topic that was not joined.
        topic: Topic,
        /// Why the subscription was refused.
        reason: String,
    },

    /// Leave a topic.
    Unsubscribe {
        /// Topic to leave.
        topic: Topic,
    },

    /// An application event fanned out to every other subscriber of a topic.
    ///
    /// The `from` field is overwritten by the hub with the sender's
    /// registered id.
    Broadcast {
        /// Topic to publish on.
        topic: Topic,
        /// Sender identity (hub-enforced).
        from: UserId,
        /// Application event name (e.g. `typing`).
        event: String,
        /// Opaque event payload.
        payload: Vec<u8>,
    },

    /// Invoke a hub procedure.
    Call {
        /// Correlates the eventual [`HubMessage::Reply`].
        request_id: u64,
        /// The procedure and its arguments.
        call: RpcCall,
    },

    /// Result of a [`HubMessage::Call`].
    Reply {
        /// Id of the call being answered.
        request_id: u64,
        /// Outcome.
        result: Result<RpcResponse, RpcFailure>,
    },

    /// A row change on a thread topic.
    Change {
        /// The `thread:` topic the change was published on.
        topic: Topic,
        /// What changed.
        change: ThreadChange,
    },

    /// Hub reports an error condition.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}
