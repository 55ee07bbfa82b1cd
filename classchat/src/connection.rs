//! Realtime connection state with exponential-backoff reconnection.
//!
//! Health is observed through a lightweight probe topic
//! (`connection:{user}`): the connection counts as [`ConnectionState::Connected`]
//! once the hub acknowledges the probe subscription. Failures schedule a
//! reconnect after `min(initial × 2^attempt, max)`; after `max_attempts`
//! failed reconnects the monitor gives up and reports
//! [`ConnectionState::Offline`] until [`ConnectionHandle::retry`] or
//! [`ConnectionHandle::foreground`] is called.
//!
//! [`ConnectionMachine`] holds the transition rules and is driven by
//! explicit [`ConnectionEvent`]s. [`ConnectionMonitor`] owns the timers and
//! the live connection, and hands out a [`ConnectionHandle`] that is itself a
//! [`Realtime`] whose subscriptions survive reconnects.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use classchat_proto::hub::{RpcCall, RpcResponse, Topic};
use classchat_proto::message::UserId;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

use crate::realtime::{self, Connector, InboundEvent, Realtime, RealtimeError, Subscription};

/// Connection lifecycle as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Subscribing the probe topic (first connect or after foreground).
    Connecting,
    /// Probe subscription acknowledged.
    Connected,
    /// Lost or failed; waiting for the backoff timer.
    Disconnected,
    /// Backoff timer fired; reconnect in progress.
    Reconnecting,
    /// Gave up after `max_attempts` reconnects. Stays here until a retry or
    /// foreground request.
    Offline,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Snapshot published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Reconnect attempts since the last successful connection.
    pub attempt: u32,
    /// Delay until the next reconnect, while [`ConnectionState::Disconnected`].
    pub retry_in: Option<Duration>,
}

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Reconnects to try before going offline. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

/// Delay before reconnect attempt `attempt`: `min(initial × 2^attempt, max)`.
#[must_use]
pub fn reconnect_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    config
        .initial_delay
        .saturating_mul(factor)
        .min(config.max_delay)
}

/// Inputs to the [`ConnectionMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The probe subscription was acknowledged.
    Connected,
    /// Connecting failed, or an established connection was lost.
    Failed,
    /// The backoff timer elapsed.
    RetryTimerFired,
    /// The app came back to the foreground.
    Foreground,
    /// The user asked to retry now.
    RetryRequested,
}

/// Transition rules for the connection lifecycle.
///
/// Events that make no sense in the current state are ignored. The only
/// path from `Connected` to `Connecting` is [`ConnectionEvent::Foreground`].
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    config: ReconnectConfig,
    state: ConnectionState,
    attempt: u32,
    retry_in: Option<Duration>,
}

impl ConnectionMachine {
    /// A machine in [`ConnectionState::Connecting`] with no attempts made.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Connecting,
            attempt: 0,
            retry_in: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current status snapshot.
    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            attempt: self.attempt,
            retry_in: self.retry_in,
        }
    }

    /// Applies an event and returns the resulting status.
    pub fn apply(&mut self, event: ConnectionEvent) -> ConnectionStatus {
        use ConnectionState as S;

        match (self.state, event) {
            (S::Connecting | S::Reconnecting, ConnectionEvent::Connected) => {
                self.enter(S::Connected);
                self.attempt = 0;
            }
            (S::Connecting | S::Reconnecting | S::Connected, ConnectionEvent::Failed) => {
                if self.config.max_attempts.is_some_and(|max| self.attempt >= max) {
                    self.enter(S::Offline);
                } else {
                    self.enter(S::Disconnected);
                    self.retry_in = Some(reconnect_delay(&self.config, self.attempt));
                }
            }
            (S::Disconnected, ConnectionEvent::RetryTimerFired) => {
                self.enter(S::Reconnecting);
                self.attempt = self.attempt.saturating_add(1);
            }
            (S::Connected | S::Disconnected, ConnectionEvent::Foreground) => {
                self.enter(S::Connecting);
            }
            (S::Offline, ConnectionEvent::Foreground)
            | (S::Offline | S::Disconnected, ConnectionEvent::RetryRequested) => {
                self.enter(S::Connecting);
                self.attempt = 0;
            }
            (state, event) => {
                tracing::trace!(%state, ?event, "connection event ignored");
            }
        }
        self.status()
    }

    fn enter(&mut self, state: ConnectionState) {
        tracing::debug!(
            from = %self.state,
            to = %state,
            attempt = self.attempt,
            "connection state"
        );
        self.state = state;
        self.retry_in = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Foreground,
    Retry,
    Shutdown,
}

/// State shared between the monitor task and its handle.
struct Shared<T> {
    current: RwLock<Option<Arc<T>>>,
    topics: Mutex<HashMap<Topic, mpsc::UnboundedSender<InboundEvent>>>,
}

impl<T: Realtime + 'static> Shared<T> {
    fn current(&self) -> Option<Arc<T>> {
        self.current.read().clone()
    }

    /// Re-establishes every stable subscription on a fresh connection.
    async fn resubscribe_all(&self, conn: &T) {
        let topics: Vec<(Topic, mpsc::UnboundedSender<InboundEvent>)> = {
            let mut topics = self.topics.lock();
            topics.retain(|_, tx| !tx.is_closed());
            topics.iter().map(|(t, tx)| (t.clone(), tx.clone())).collect()
        };
        for (topic, tx) in topics {
            match conn.subscribe(&topic).await {
                Ok(sub) => {
                    tokio::spawn(realtime::forward(sub, tx));
                }
                Err(e) => {
                    tracing::warn!(topic = %topic, err = %e, "resubscribe failed");
                }
            }
        }
    }
}

/// Background task that keeps a hub connection alive.
pub struct ConnectionMonitor<C: Connector> {
    connector: C,
    machine: ConnectionMachine,
    probe: Topic,
    shared: Arc<Shared<C::Conn>>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ConnectionStatus>,
}

impl<C: Connector> ConnectionMonitor<C> {
    /// Spawns the monitor and returns a handle to it.
    ///
    /// The monitor stops when [`ConnectionHandle::shutdown`] is called or the
    /// handle is dropped.
    #[must_use]
    pub fn spawn(connector: C, config: ReconnectConfig) -> ConnectionHandle<C::Conn> {
        let local_id = connector.local_id().clone();
        let machine = ConnectionMachine::new(config);
        let (status_tx, status_rx) = watch::channel(machine.status());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            current: RwLock::new(None),
            topics: Mutex::new(HashMap::new()),
        });

        let monitor = Self {
            probe: Topic::connection(&local_id),
            connector,
            machine,
            shared: Arc::clone(&shared),
            commands: cmd_rx,
            status: status_tx,
        };
        tokio::spawn(monitor.run());

        ConnectionHandle {
            local_id,
            commands: cmd_tx,
            status: status_rx,
            shared,
        }
    }

    async fn run(mut self) {
        let mut live: Option<Arc<C::Conn>> = None;

        loop {
            match self.machine.state() {
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    self.publish();
                    let reuse = live.take();
                    let Some(result) = self.establish_or_shutdown(reuse).await else {
                        break;
                    };
                    match result {
                        Ok(conn) => {
                            *self.shared.current.write() = Some(Arc::clone(&conn));
                            self.shared.resubscribe_all(&conn).await;
                            live = Some(conn);
                            self.machine.apply(ConnectionEvent::Connected);
                            tracing::info!(topic = %self.probe, "realtime connected");
                        }
                        Err(e) => {
                            tracing::warn!(
                                err = %e,
                                attempt = self.machine.status().attempt,
                                "connect failed"
                            );
                            self.clear_current();
                            self.machine.apply(ConnectionEvent::Failed);
                        }
                    }
                }
                ConnectionState::Connected => {
                    self.publish();
                    let Some(conn) = live.clone() else {
                        self.machine.apply(ConnectionEvent::Failed);
                        continue;
                    };
                    tokio::select! {
                        () = conn.closed() => {
                            tracing::warn!("realtime connection lost");
                            live = None;
                            self.clear_current();
                            self.machine.apply(ConnectionEvent::Failed);
                        }
                        cmd = self.commands.recv() => match cmd {
                            Some(Command::Foreground) => {
                                tracing::info!("foreground: resubscribing probe");
                                self.machine.apply(ConnectionEvent::Foreground);
                            }
                            Some(Command::Retry) => {}
                            None | Some(Command::Shutdown) => break,
                        }
                    }
                }
                ConnectionState::Disconnected => {
                    self.publish();
                    let delay = self.machine.status().retry_in.unwrap_or_default();
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {
                            self.machine.apply(ConnectionEvent::RetryTimerFired);
                        }
                        cmd = self.commands.recv() => match cmd {
                            Some(Command::Foreground) => {
                                self.machine.apply(ConnectionEvent::Foreground);
                            }
                            Some(Command::Retry) => {
                                self.machine.apply(ConnectionEvent::RetryRequested);
                            }
                            None | Some(Command::Shutdown) => break,
                        }
                    }
                }
                ConnectionState::Offline => {
                    self.publish();
                    tracing::warn!("realtime offline, waiting for retry");
                    match self.commands.recv().await {
                        Some(Command::Foreground) => {
                            self.machine.apply(ConnectionEvent::Foreground);
                        }
                        Some(Command::Retry) => {
                            self.machine.apply(ConnectionEvent::RetryRequested);
                        }
                        None | Some(Command::Shutdown) => break,
                    }
                }
            }
        }

        if let Some(conn) = live.take() {
            let _ = conn.unsubscribe(&self.probe).await;
        }
        self.clear_current();
        self.shared.topics.lock().clear();
        tracing::info!("connection monitor stopped");
    }

    /// Runs [`establish`] while still honouring a shutdown request.
    async fn establish_or_shutdown(
        &mut self,
        reuse: Option<Arc<C::Conn>>,
    ) -> Option<Result<Arc<C::Conn>, RealtimeError>> {
        let attempt = establish(&self.connector, &self.probe, reuse);
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                res = &mut attempt => return Some(res),
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return None,
                    Some(cmd) => tracing::debug!(?cmd, "already connecting, command ignored"),
                },
            }
        }
    }

    fn clear_current(&self) {
        *self.shared.current.write() = None;
    }

    fn publish(&self) {
        self.status.send_replace(self.machine.status());
    }
}

/// Subscribes the probe topic, on `reuse` if it is still open, otherwise on
/// a fresh connection. Probe events are drained and dropped.
async fn establish<C: Connector>(
    connector: &C,
    probe: &Topic,
    reuse: Option<Arc<C::Conn>>,
) -> Result<Arc<C::Conn>, RealtimeError> {
    let conn = match reuse {
        Some(conn) if conn.is_connected() => {
            if let Err(e) = conn.unsubscribe(probe).await {
                tracing::debug!(err = %e, "probe unsubscribe failed");
            }
            conn
        }
        _ => Arc::new(connector.connect().await?),
    };
    let sub = conn.subscribe(probe).await?;
    tokio::spawn(realtime::discard(sub));
    Ok(conn)
}

/// Handle to a running [`ConnectionMonitor`].
///
/// Implements [`Realtime`]: subscriptions made through it are re-established
/// on every new connection and keep delivering into the same
/// [`Subscription`]. Broadcasts and calls while not connected fail fast with
/// [`RealtimeError::ConnectionClosed`].
pub struct ConnectionHandle<T: Realtime + 'static> {
    local_id: UserId,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    shared: Arc<Shared<T>>,
}

impl<T: Realtime + 'static> ConnectionHandle<T> {
    /// Latest status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// A receiver that observes every published status.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Waits until `pred` holds for the published status, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::ConnectionClosed`] if the monitor stops first.
    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(&ConnectionStatus) -> bool + Send,
    ) -> Result<ConnectionStatus, RealtimeError> {
        let mut rx = self.status.clone();
        let status = *rx
            .wait_for(|s| pred(s))
            .await
            .map_err(|_| RealtimeError::ConnectionClosed)?;
        Ok(status)
    }

    /// App returned to the foreground: force a probe resubscribe, or skip
    /// the backoff wait, or leave `Offline`.
    pub fn foreground(&self) {
        self.send(Command::Foreground);
    }

    /// Retry now from `Disconnected` or `Offline`, resetting the attempt counter.
    pub fn retry(&self) {
        self.send(Command::Retry);
    }

    /// Stops the monitor and releases the connection.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            tracing::debug!(?cmd, "connection monitor already stopped");
        }
    }

    fn live(&self) -> Result<Arc<T>, RealtimeError> {
        if !self.is_connected() {
            return Err(RealtimeError::ConnectionClosed);
        }
        self.shared.current().ok_or(RealtimeError::ConnectionClosed)
    }
}

impl<T: Realtime + 'static> Realtime for ConnectionHandle<T> {
    fn local_id(&self) -> &UserId {
        &self.local_id
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, RealtimeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.topics.lock().insert(topic.clone(), tx.clone());

        if let Some(conn) = self.shared.current() {
            match conn.subscribe(topic).await {
                Ok(sub) => {
                    tokio::spawn(realtime::forward(sub, tx));
                }
                Err(e @ (RealtimeError::Rejected(_) | RealtimeError::Rpc(_))) => {
                    let mut topics = self.shared.topics.lock();
                    if topics.get(topic).is_some_and(|t| t.same_channel(&tx)) {
                        topics.remove(topic);
                    }
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(
                        topic = %topic,
                        err = %e,
                        "subscription deferred until reconnect"
                    );
                }
            }
        }
        Ok(Subscription::new(topic.clone(), rx))
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), RealtimeError> {
        self.shared.topics.lock().remove(topic);
        match self.shared.current() {
            Some(conn) => match conn.unsubscribe(topic).await {
                Ok(()) | Err(RealtimeError::ConnectionClosed) => Ok(()),
                Err(e) => Err(e),
            },
            None => Ok(()),
        }
    }

    async fn broadcast(
        &self,
        topic: &Topic,
        event: &str,
        payload: Vec<u8>,
    ) -> Result<(), RealtimeError> {
        self.live()?.broadcast(topic, event, payload).await
    }

    async fn call(&self, call: RpcCall) -> Result<RpcResponse, RealtimeError> {
        self.live()?.call(call).await
    }

    async fn closed(&self) {
        let mut rx = self.status.clone();
        while rx.changed().await.is_ok() {}
    }

    fn is_connected(&self) -> bool {
        self.status.borrow().state == ConnectionState::Connected
    }
}
