//! Thread summary rows returned by the `ThreadsSummary` RPC.

use serde::{Deserialize, Serialize};

use crate::message::{ThreadId, Timestamp, UserId};

/// Maximum characters kept in a [`MessagePreview`].
pub const PREVIEW_CHARS: usize = 80;

/// Compact view of the latest message in a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    /// Display name of the author.
    pub sender_name: String,
    /// First line of the body, truncated to [`PREVIEW_CHARS`].
    pub text: String,
    /// When the message was stored.
    pub created_at: Timestamp,
}

/// One row of the inbox: a thread the caller participates in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    /// The thread.
    pub thread_id: ThreadId,
    /// Human-readable subject line.
    pub subject: String,
    /// Everyone in the thread, including the caller.
    pub participants: Vec<UserId>,
    /// The most recent message, if any.
    pub last_message: Option<MessagePreview>,
    /// Messages from other participants the caller has not read.
    pub unread_count: u32,
    /// Time of the latest activity (last message or thread creation).
    pub updated_at: Timestamp,
}

impl ThreadSummary {
    /// Whether the caller has unread messages in this thread.
    #[must_use]
    pub const fn has_unread(&self) -> bool {
        self.unread_count > 0
    }
}
