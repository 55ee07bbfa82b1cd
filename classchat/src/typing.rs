//! Typing indicator for a message thread.
//!
//! Outbound, [`TypingThrottle`] announces `is_typing: true` at most once per
//! throttle window and arms an inactivity deadline after which
//! `is_typing: false` is sent automatically. Inbound, [`TypingRoster`] merges
//! other users' signals and sweeps out entries that went silent.
//!
//! Both are pure and driven by explicit instants; [`TypingIndicator`] runs
//! them in a task against a [`Realtime`] connection on the thread's
//! `typing:` topic.

use std::sync::Arc;
use std::time::Duration;

use classchat_proto::codec;
use classchat_proto::hub::Topic;
use classchat_proto::message::{ThreadId, Timestamp, UserId};
use classchat_proto::typing::{TYPING_EVENT, TypingSignal};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::realtime::{InboundEvent, Realtime, RealtimeError};

/// Timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingConfig {
    /// Minimum spacing between `is_typing: true` broadcasts.
    pub throttle: Duration,
    /// Inactivity after which `is_typing: false` is sent.
    pub timeout: Duration,
    /// How often stale remote entries are swept.
    pub sweep_interval: Duration,
    /// Extra time a remote entry survives past `timeout`.
    pub stale_grace: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_secs(2),
            timeout: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(1),
            stale_grace: Duration::from_secs(1),
        }
    }
}

/// Outbound throttle and auto-clear timer.
#[derive(Debug, Clone)]
pub struct TypingThrottle {
    config: TypingConfig,
    last_announced: Option<Instant>,
    deadline: Option<Instant>,
}

impl TypingThrottle {
    /// A throttle that has announced nothing.
    #[must_use]
    pub const fn new(config: TypingConfig) -> Self {
        Self {
            config,
            last_announced: None,
            deadline: None,
        }
    }

    /// Records a keystroke at `now`. Returns whether `is_typing: true` must
    /// be broadcast. Always re-arms the inactivity deadline.
    pub fn on_input(&mut self, now: Instant) -> bool {
        self.deadline = Some(now + self.config.timeout);
        let announce = self
            .last_announced
            .is_none_or(|last| now.duration_since(last) >= self.config.throttle);
        if announce {
            self.last_announced = Some(now);
        }
        announce
    }

    /// Cancels the deadline and resets the window, so the next keystroke is
    /// announced at once. The caller broadcasts `is_typing: false`.
    pub const fn clear(&mut self) {
        self.deadline = None;
        self.last_announced = None;
    }

    /// Returns `true` exactly once when the deadline has passed; the caller
    /// then broadcasts `is_typing: false`.
    pub fn poll_expired(&mut self, now: Instant) -> bool {
        if self.deadline.is_some_and(|d| now >= d) {
            self.clear();
            true
        } else {
            false
        }
    }

    /// Pending auto-clear deadline.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// A remote user currently typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    /// Who is typing.
    pub user_id: UserId,
    /// Display name from their latest signal.
    pub user_name: String,
    /// Local receive time of their latest signal.
    pub last_seen: Instant,
}

/// Remote typing state, in order of first appearance.
#[derive(Debug, Clone)]
pub struct TypingRoster {
    local_id: UserId,
    max_age: Duration,
    users: Vec<TypingUser>,
}

impl TypingRoster {
    /// An empty roster that ignores signals from `local_id`.
    #[must_use]
    pub fn new(local_id: UserId, config: &TypingConfig) -> Self {
        Self {
            local_id,
            max_age: config.timeout + config.stale_grace,
            users: Vec::new(),
        }
    }

    /// Merges a signal from `from` received at `now`. Returns whether the
    /// visible list changed.
    pub fn apply(&mut self, from: &UserId, signal: &TypingSignal, now: Instant) -> bool {
        if *from == self.local_id || signal.user_id == self.local_id {
            return false;
        }
        let pos = self.users.iter().position(|u| u.user_id == *from);
        match (signal.is_typing, pos) {
            (true, Some(i)) => {
                let user = &mut self.users[i];
                user.last_seen = now;
                let renamed = user.user_name != signal.user_name;
                user.user_name.clone_from(&signal.user_name);
                renamed
            }
            (true, None) => {
                self.users.push(TypingUser {
                    user_id: from.clone(),
                    user_name: signal.user_name.clone(),
                    last_seen: now,
                });
                true
            }
            (false, Some(i)) => {
                self.users.remove(i);
                true
            }
            (false, None) => false,
        }
    }

    /// Drops entries not refreshed within `timeout + grace`. Returns whether
    /// anything was removed.
    pub fn sweep(&mut self, now: Instant) -> bool {
        let before = self.users.len();
        self.users
            .retain(|u| now.saturating_duration_since(u.last_seen) <= self.max_age);
        self.users.len() != before
    }

    /// Users currently typing.
    #[must_use]
    pub fn users(&self) -> &[TypingUser] {
        &self.users
    }

    /// Human-readable summary of the roster.
    #[must_use]
    pub fn typing_text(&self) -> Option<String> {
        let names: Vec<&str> = self.users.iter().map(|u| u.user_name.as_str()).collect();
        typing_text(&names)
    }
}

/// Renders the typing line for the given display names.
///
/// ```
/// use classchat::typing::typing_text;
///
/// assert_eq!(typing_text(&[]), None);
/// assert_eq!(typing_text(&["Ms Dlamini"]).as_deref(), Some("Ms Dlamini is typing…"));
/// assert_eq!(typing_text(&["A", "B"]).as_deref(), Some("A and B are typing…"));
/// assert_eq!(typing_text(&["A", "B", "C"]).as_deref(), Some("3 people are typing…"));
/// ```
#[must_use]
pub fn typing_text(names: &[&str]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("{one} is typing…")),
        [a, b] => Some(format!("{a} and {b} are typing…")),
        many => Some(format!("{} people are typing…", many.len())),
    }
}

/// What observers of a [`TypingIndicator`] see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypingSnapshot {
    /// `(user_id, display name)` of everyone typing, first appearance first.
    pub users: Vec<(UserId, String)>,
    /// Rendered typing line.
    pub text: Option<String>,
}

impl TypingSnapshot {
    fn of(roster: &TypingRoster) -> Self {
        Self {
            users: roster
                .users()
                .iter()
                .map(|u| (u.user_id.clone(), u.user_name.clone()))
                .collect(),
            text: roster.typing_text(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    SetTyping,
    ClearTyping,
}

/// Typing indicator bound to one thread.
///
/// Dropping the indicator stops its task, which unsubscribes the topic.
pub struct TypingIndicator {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<TypingSnapshot>,
    topic: Topic,
}

impl TypingIndicator {
    /// Subscribes `typing:{thread_id}` and starts the indicator task.
    ///
    /// # Errors
    ///
    /// Returns the subscription error if the topic cannot be joined.
    pub async fn spawn<R: Realtime + 'static>(
        realtime: Arc<R>,
        thread_id: ThreadId,
        user_name: impl Into<String>,
        config: TypingConfig,
    ) -> Result<Self, RealtimeError> {
        let topic = Topic::typing(thread_id);
        let subscription = realtime.subscribe(&topic).await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snap_tx, snap_rx) = watch::channel(TypingSnapshot::default());

        let task = IndicatorTask {
            roster: TypingRoster::new(realtime.local_id().clone(), &config),
            throttle: TypingThrottle::new(config),
            sweep_interval: config.sweep_interval,
            user_name: user_name.into(),
            topic: topic.clone(),
            realtime,
            snapshot: snap_tx,
        };
        tokio::spawn(task.run(subscription, cmd_rx));

        Ok(Self {
            commands: cmd_tx,
            snapshot: snap_rx,
            topic,
        })
    }

    /// Call on every keystroke.
    pub fn set_typing(&self) {
        self.send(Command::SetTyping);
    }

    /// Call on send: immediately announces `is_typing: false`.
    pub fn clear_typing(&self) {
        self.send(Command::ClearTyping);
    }

    /// Current remote typing state.
    #[must_use]
    pub fn snapshot(&self) -> TypingSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current typing line.
    #[must_use]
    pub fn typing_text(&self) -> Option<String> {
        self.snapshot.borrow().text.clone()
    }

    /// Observe every change to the remote typing state.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<TypingSnapshot> {
        self.snapshot.clone()
    }

    /// The topic this indicator lives on.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    fn send(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            tracing::debug!(topic = %self.topic, ?cmd, "typing indicator task gone");
        }
    }
}

struct IndicatorTask<R> {
    roster: TypingRoster,
    throttle: TypingThrottle,
    sweep_interval: Duration,
    user_name: String,
    topic: Topic,
    realtime: Arc<R>,
    snapshot: watch::Sender<TypingSnapshot>,
}

impl<R: Realtime + 'static> IndicatorTask<R> {
    async fn run(
        mut self,
        mut subscription: crate::realtime::Subscription,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        // `interval` panics on a zero period.
        let period = self.sweep_interval.max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbound_open = true;

        loop {
            let deadline = self.throttle.deadline();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::SetTyping) => {
                        if self.throttle.on_input(Instant::now()) {
                            self.announce(true).await;
                        }
                    }
                    Some(Command::ClearTyping) => {
                        self.throttle.clear();
                        self.announce(false).await;
                    }
                    None => break,
                },
                () = sleep_until_opt(deadline) => {
                    if self.throttle.poll_expired(Instant::now()) {
                        self.announce(false).await;
                    }
                }
                event = subscription.recv(), if inbound_open => match event {
                    Some(event) => self.on_inbound(event),
                    None => {
                        tracing::debug!(topic = %self.topic, "typing subscription closed");
                        inbound_open = false;
                    }
                },
                _ = sweep.tick() => {
                    if self.roster.sweep(Instant::now()) {
                        self.publish();
                    }
                }
            }
        }

        if let Err(e) = self.realtime.unsubscribe(&self.topic).await {
            tracing::debug!(topic = %self.topic, err = %e, "typing unsubscribe failed");
        }
        tracing::debug!(topic = %self.topic, "typing indicator stopped");
    }

    fn on_inbound(&mut self, event: InboundEvent) {
        let InboundEvent::Broadcast {
            from,
            event,
            payload,
        } = event
        else {
            return;
        };
        if event != TYPING_EVENT {
            return;
        }
        match codec::decode::<TypingSignal>(&payload) {
            Ok(signal) => {
                if self.roster.apply(&from, &signal, Instant::now()) {
                    self.publish();
                }
            }
            Err(e) => {
                tracing::debug!(from = %from, err = %e, "malformed typing payload");
            }
        }
    }

    /// Fire-and-forget: failures are logged and dropped.
    async fn announce(&self, is_typing: bool) {
        let signal = TypingSignal {
            user_id: self.realtime.local_id().clone(),
            user_name: self.user_name.clone(),
            timestamp: Timestamp::now(),
            is_typing,
        };
        let payload = match codec::encode(&signal) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(err = %e, "typing signal not encoded");
                return;
            }
        };
        if let Err(e) = self
            .realtime
            .broadcast(&self.topic, TYPING_EVENT, payload)
            .await
        {
            tracing::debug!(topic = %self.topic, is_typing, err = %e, "typing broadcast dropped");
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(TypingSnapshot::of(&self.roster));
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
