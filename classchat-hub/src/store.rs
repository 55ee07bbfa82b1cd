//! In-memory message-thread store.
//!
//! The [`ThreadStore`] holds threads, their participants and a capped FIFO
//! of messages per thread. It implements the row-level behaviour behind the
//! thread RPCs: posting, listing, delivery/read marking and the inbox
//! summary. Everything is lost on hub restart.

use std::collections::{BTreeSet, HashMap, VecDeque};

use classchat_proto::hub::RpcFailure;
use classchat_proto::message::{self, MessageId, ThreadId, ThreadMessage, Timestamp, UserId};
use classchat_proto::thread::{MessagePreview, PREVIEW_CHARS, ThreadSummary};
use tokio::sync::RwLock;

/// Default maximum number of messages kept per thread before FIFO eviction.
const DEFAULT_MAX_MESSAGES_PER_THREAD: usize = 1000;

/// Maximum length of a thread subject in characters.
const MAX_SUBJECT_CHARS: usize = 200;

#[derive(Debug)]
struct ThreadRecord {
    subject: String,
    participants: BTreeSet<UserId>,
    created_at: Timestamp,
    messages: VecDeque<ThreadMessage>,
}

impl ThreadRecord {
    fn check_participant(&self, thread_id: ThreadId, user: &UserId) -> Result<(), RpcFailure> {
        if self.participants.contains(user) {
            Ok(())
        } else {
            Err(RpcFailure::NotParticipant(thread_id))
        }
    }

    fn summary_for(&self, thread_id: ThreadId, user: &UserId) -> ThreadSummary {
        let last = self.messages.back();
        let unread = self
            .messages
            .iter()
            .filter(|m| m.sender_id != *user && m.read_at.is_none())
            .count();
        ThreadSummary {
            thread_id,
            subject: self.subject.clone(),
            participants: self.participants.iter().cloned().collect(),
            last_message: last.map(|m| MessagePreview {
                sender_name: m.sender_name.clone(),
                text: m.preview(PREVIEW_CHARS),
                created_at: m.created_at,
            }),
            unread_count: u32::try_from(unread).unwrap_or(u32::MAX),
            updated_at: last.map_or(self.created_at, |m| m.created_at),
        }
    }
}

/// In-memory thread store.
///
/// Thread-safe via [`RwLock`]. Each thread keeps at most
/// `max_messages_per_thread` messages; when the cap is exceeded the oldest
/// message is dropped.
pub struct ThreadStore {
    threads: RwLock<HashMap<ThreadId, ThreadRecord>>,
    max_messages_per_thread: usize,
}

impl Default for ThreadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadStore {
    /// Creates an empty store with the default per-thread message cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_messages(DEFAULT_MAX_MESSAGES_PER_THREAD)
    }

    /// Creates an empty store with a custom per-thread message cap.
    #[must_use]
    pub fn with_max_messages(max_messages_per_thread: usize) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            max_messages_per_thread: max_messages_per_thread.max(1),
        }
    }

    /// Creates a thread. The creator is always a participant.
    ///
    /// # Errors
    ///
    /// Returns [`RpcFailure::Invalid`] if the subject is blank or too long.
    pub async fn create_thread(
        &self,
        creator: &UserId,
        subject: &str,
        participants: &[UserId],
        now: Timestamp,
    ) -> Result<ThreadId, RpcFailure> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(RpcFailure::Invalid("subject is empty".into()));
        }
        if subject.chars().count() > MAX_SUBJECT_CHARS {
            return Err(RpcFailure::Invalid(format!(
                "subject longer than {MAX_SUBJECT_CHARS} characters"
            )));
        }

        let mut members: BTreeSet<UserId> = participants
            .iter()
            .filter(|p| !p.as_str().is_empty())
            .cloned()
            .collect();
        members.insert(creator.clone());

        let thread_id = ThreadId::new();
        self.threads.write().await.insert(
            thread_id,
            ThreadRecord {
                subject: subject.to_string(),
                participants: members,
                created_at: now,
                messages: VecDeque::new(),
            },
        );
        Ok(thread_id)
    }

    /// Whether `user` participates in the thread.
    pub async fn is_participant(&self, thread_id: ThreadId, user: &UserId) -> bool {
        self.threads
            .read()
            .await
            .get(&thread_id)
            .is_some_and(|t| t.participants.contains(user))
    }

    /// Stores a message.
    ///
    /// Posting an id that is already stored returns the stored row unchanged,
    /// so a client may safely retry. The id must have been posted by the
    /// same sender.
    ///
    /// # Errors
    ///
    /// Returns [`RpcFailure::UnknownThread`], [`RpcFailure::NotParticipant`],
    /// or [`RpcFailure::Invalid`] if the body fails validation or the id
    /// belongs to another sender's message.
    pub async fn post_message(
        &self,
        thread_id: ThreadId,
        sender: &UserId,
        message_id: MessageId,
        sender_name: &str,
        body: &str,
        now: Timestamp,
    ) -> Result<ThreadMessage, RpcFailure> {
        message::validate_body(body).map_err(|e| RpcFailure::Invalid(e.to_string()))?;

        let mut threads = self.threads.write().await;
        let thread = threads
            .get_mut(&thread_id)
            .ok_or(RpcFailure::UnknownThread(thread_id))?;
        thread.check_participant(thread_id, sender)?;

        if let Some(existing) = thread.messages.iter().find(|m| m.id == message_id) {
            if existing.sender_id != *sender {
                return Err(RpcFailure::Invalid(format!(
                    "message id {message_id} is already taken"
                )));
            }
            return Ok(existing.clone());
        }

        let stored = ThreadMessage {
            id: message_id,
            thread_id,
            sender_id: sender.clone(),
            sender_name: sender_name.to_string(),
            body: body.to_string(),
            created_at: now,
            delivered_at: None,
            read_at: None,
        };
        thread.messages.push_back(stored.clone());
        if thread.messages.len() > self.max_messages_per_thread {
            thread.messages.pop_front();
        }
        drop(threads);
        Ok(stored)
    }

    /// Returns every stored message in a thread, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`RpcFailure::UnknownThread`] or [`RpcFailure::NotParticipant`].
    pub async fn messages(
        &self,
        thread_id: ThreadId,
        user: &UserId,
    ) -> Result<Vec<ThreadMessage>, RpcFailure> {
        let threads = self.threads.read().await;
        let thread = threads
            .get(&thread_id)
            .ok_or(RpcFailure::UnknownThread(thread_id))?;
        thread.check_participant(thread_id, user)?;
        Ok(thread.messages.iter().cloned().collect())
    }

    /// Marks every message from other participants that has not been
    /// delivered yet as delivered at `now`. Returns the ids that changed.
    ///
    /// # Errors
    ///
    /// Returns [`RpcFailure::UnknownThread`] or [`RpcFailure::NotParticipant`].
    pub async fn mark_delivered(
        &self,
        thread_id: ThreadId,
        recipient: &UserId,
        now: Timestamp,
    ) -> Result<Vec<MessageId>, RpcFailure> {
        let mut threads = self.threads.write().await;
        let thread = threads
            .get_mut(&thread_id)
            .ok_or(RpcFailure::UnknownThread(thread_id))?;
        thread.check_participant(thread_id, recipient)?;

        let mut changed = Vec::new();
        for msg in thread
            .messages
            .iter_mut()
            .filter(|m| m.sender_id != *recipient && m.delivered_at.is_none())
        {
            msg.delivered_at = Some(now);
            changed.push(msg.id);
        }
        drop(threads);
        Ok(changed)
    }

    /// Marks every unread message from other participants as read at `now`.
    /// A read message is also delivered. Returns the ids that changed.
    ///
    /// # Errors
    ///
    /// Returns [`RpcFailure::UnknownThread`] or [`RpcFailure::NotParticipant`].
    pub async fn mark_read(
        &self,
        thread_id: ThreadId,
        recipient: &UserId,
        now: Timestamp,
    ) -> Result<Vec<MessageId>, RpcFailure> {
        let mut threads = self.threads.write().await;
        let thread = threads
            .get_mut(&thread_id)
            .ok_or(RpcFailure::UnknownThread(thread_id))?;
        thread.check_participant(thread_id, recipient)?;

        let mut changed = Vec::new();
        for msg in thread
            .messages
            .iter_mut()
            .filter(|m| m.sender_id != *recipient && m.read_at.is_none())
        {
            msg.delivered_at.get_or_insert(now);
            msg.read_at = Some(now);
            changed.push(msg.id);
        }
        drop(threads);
        Ok(changed)
    }

    /// Inbox for `user`: every thread they participate in, most recently
    /// active first.
    pub async fn summaries(&self, user: &UserId) -> Vec<ThreadSummary> {
        let threads = self.threads.read().await;
        let mut rows: Vec<ThreadSummary> = threads
            .iter()
            .filter(|(_, t)| t.participants.contains(user))
            .map(|(id, t)| t.summary_for(*id, user))
            .collect();
        drop(threads);
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows
    }
}
