//! Typing indicator signal broadcast on a thread's typing topic.

use serde::{Deserialize, Serialize};

use crate::message::{Timestamp, UserId};

/// Broadcast event name carrying a postcard-encoded [`TypingSignal`].
pub const TYPING_EVENT: &str = "typing";

/// A typing indicator sent between thread participants.
///
/// Ephemeral: never persisted by the hub, only fanned out to the other
/// subscribers of the thread's typing topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    /// The user who is typing (or stopped typing).
    pub user_id: UserId,
    /// Display name shown in "X is typing…".
    pub user_name: String,
    /// Sender clock at the moment the signal was produced.
    pub timestamp: Timestamp,
    /// Whether the user is currently typing (`true`) or stopped (`false`).
    pub is_typing: bool,
}
