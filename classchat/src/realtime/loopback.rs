//! In-process hub for testing.
//!
//! [`LoopbackHub`] mimics the realtime hub with plain channels: topic
//! fan-out that skips the sender, a scriptable RPC handler, and injectable
//! outages. Connections are created with [`LoopbackHub::connect`] or through
//! a [`LoopbackConnector`].

use std::collections::HashMap;
use std::sync::Arc;

use classchat_proto::hub::{RpcCall, RpcFailure, RpcResponse, ThreadChange, Topic};
use classchat_proto::message::UserId;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{Connector, InboundEvent, Realtime, RealtimeError, Subscription};

/// Scripted RPC behaviour: `(caller, call) -> result`.
pub type RpcHandler = dyn Fn(&UserId, RpcCall) -> Result<RpcResponse, RpcFailure> + Send + Sync;

struct LoopbackConn {
    user: UserId,
    routes: HashMap<Topic, mpsc::UnboundedSender<InboundEvent>>,
    closed: watch::Sender<bool>,
}

struct HubInner {
    available: bool,
    next_conn_id: u64,
    connect_attempts: usize,
    conns: HashMap<u64, LoopbackConn>,
    rpc_handler: Option<Arc<RpcHandler>>,
    broadcasts: Vec<(UserId, Topic, String, Vec<u8>)>,
    subscribe_calls: HashMap<Topic, usize>,
    unsubscribe_calls: HashMap<Topic, usize>,
}

/// An in-process hub shared by every [`LoopbackRealtime`] it creates.
///
/// Cloning yields another handle to the same hub.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    /// Creates an available hub with no RPC handler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                available: true,
                next_conn_id: 1,
                connect_attempts: 0,
                conns: HashMap::new(),
                rpc_handler: None,
                broadcasts: Vec::new(),
                subscribe_calls: HashMap::new(),
                unsubscribe_calls: HashMap::new(),
            })),
        }
    }

    /// Open a connection registered as `user`.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Unreachable`] while the hub is unavailable.
    pub fn connect(&self, user: UserId) -> Result<LoopbackRealtime, RealtimeError> {
        let mut inner = self.inner.lock();
        inner.connect_attempts += 1;
        if !inner.available {
            return Err(RealtimeError::Unreachable("loopback".into()));
        }
        let conn_id = inner.next_conn_id;
        inner.next_conn_id += 1;
        let (closed_tx, closed_rx) = watch::channel(false);
        inner.conns.insert(
            conn_id,
            LoopbackConn {
                user: user.clone(),
                routes: HashMap::new(),
                closed: closed_tx,
            },
        );
        drop(inner);
        Ok(LoopbackRealtime {
            hub: self.clone(),
            conn_id,
            local_id: user,
            closed: closed_rx,
        })
    }

    /// Toggle availability. While unavailable, connects and subscriptions
    /// fail; existing connections stay open until [`LoopbackHub::disconnect_all`].
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    /// Close every connection registered as `user`.
    pub fn disconnect(&self, user: &UserId) {
        self.inner.lock().conns.retain(|_, conn| {
            if conn.user == *user {
                let _ = conn.closed.send(true);
                false
            } else {
                true
            }
        });
    }

    /// Close every connection.
    pub fn disconnect_all(&self) {
        for (_, conn) in self.inner.lock().conns.drain() {
            let _ = conn.closed.send(true);
        }
    }

    /// Install the RPC handler used for every subsequent call.
    pub fn set_rpc_handler(
        &self,
        handler: impl Fn(&UserId, RpcCall) -> Result<RpcResponse, RpcFailure>
        + Send
        + Sync
        + 'static,
    ) {
        self.inner.lock().rpc_handler = Some(Arc::new(handler));
    }

    /// Push a row change to every subscriber of `topic`.
    pub fn publish_change(&self, topic: &Topic, change: &ThreadChange) {
        let inner = self.inner.lock();
        for conn in inner.conns.values() {
            if let Some(tx) = conn.routes.get(topic) {
                let _ = tx.send(InboundEvent::Change(change.clone()));
            }
        }
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.lock().conns.len()
    }

    /// Number of connects attempted, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.inner.lock().connect_attempts
    }

    /// Users currently subscribed to `topic`.
    #[must_use]
    pub fn subscribers(&self, topic: &Topic) -> Vec<UserId> {
        let inner = self.inner.lock();
        let mut users: Vec<UserId> = inner
            .conns
            .values()
            .filter(|c| c.routes.contains_key(topic))
            .map(|c| c.user.clone())
            .collect();
        users.sort();
        users
    }

    /// Every broadcast accepted so far: `(sender, topic, event, payload)`.
    #[must_use]
    pub fn broadcasts(&self) -> Vec<(UserId, Topic, String, Vec<u8>)> {
        self.inner.lock().broadcasts.clone()
    }

    /// Subscribe requests accepted for `topic`, by any connection.
    #[must_use]
    pub fn subscribe_calls(&self, topic: &Topic) -> usize {
        self.inner.lock().subscribe_calls.get(topic).copied().unwrap_or(0)
    }

    /// Unsubscribe requests received for `topic`, by any connection.
    #[must_use]
    pub fn unsubscribe_calls(&self, topic: &Topic) -> usize {
        self.inner.lock().unsubscribe_calls.get(topic).copied().unwrap_or(0)
    }
}

/// One connection to a [`LoopbackHub`]. Dropping it disconnects.
pub struct LoopbackRealtime {
    hub: LoopbackHub,
    conn_id: u64,
    local_id: UserId,
    closed: watch::Receiver<bool>,
}

impl Drop for LoopbackRealtime {
    fn drop(&mut self) {
        if let Some(conn) = self.hub.inner.lock().conns.remove(&self.conn_id) {
            let _ = conn.closed.send(true);
        }
    }
}

impl Realtime for LoopbackRealtime {
    fn local_id(&self) -> &UserId {
        &self.local_id
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, RealtimeError> {
        // The ack takes a scheduler turn, as a hub round trip would.
        tokio::task::yield_now().await;
        let mut inner = self.hub.inner.lock();
        if !inner.available {
            return Err(RealtimeError::Timeout);
        }
        if topic.probe_owner().is_some_and(|owner| owner != self.local_id.as_str()) {
            return Err(RealtimeError::Rejected(format!("{topic} belongs to another user")));
        }
        let conn = inner
            .conns
            .get_mut(&self.conn_id)
            .ok_or(RealtimeError::ConnectionClosed)?;
        let (tx, rx) = mpsc::unbounded_channel();
        conn.routes.insert(topic.clone(), tx);
        *inner.subscribe_calls.entry(topic.clone()).or_default() += 1;
        drop(inner);
        Ok(Subscription::new(topic.clone(), rx))
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), RealtimeError> {
        let mut inner = self.hub.inner.lock();
        let conn = inner
            .conns
            .get_mut(&self.conn_id)
            .ok_or(RealtimeError::ConnectionClosed)?;
        conn.routes.remove(topic);
        *inner.unsubscribe_calls.entry(topic.clone()).or_default() += 1;
        drop(inner);
        Ok(())
    }

    async fn broadcast(
        &self,
        topic: &Topic,
        event: &str,
        payload: Vec<u8>,
    ) -> Result<(), RealtimeError> {
        let mut inner = self.hub.inner.lock();
        if !inner.conns.contains_key(&self.conn_id) {
            return Err(RealtimeError::ConnectionClosed);
        }
        if topic.probe_owner().is_some() {
            return Err(RealtimeError::Rejected(format!("broadcasts are not allowed on {topic}")));
        }
        for conn in inner.conns.values() {
            if conn.user == self.local_id {
                continue;
            }
            if let Some(tx) = conn.routes.get(topic) {
                let _ = tx.send(InboundEvent::Broadcast {
                    from: self.local_id.clone(),
                    event: event.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        inner.broadcasts.push((
            self.local_id.clone(),
            topic.clone(),
            event.to_string(),
            payload,
        ));
        drop(inner);
        Ok(())
    }

    async fn call(&self, call: RpcCall) -> Result<RpcResponse, RealtimeError> {
        let handler = {
            let inner = self.hub.inner.lock();
            if !inner.conns.contains_key(&self.conn_id) {
                return Err(RealtimeError::ConnectionClosed);
            }
            inner.rpc_handler.clone()
        };
        let Some(handler) = handler else {
            return Err(RealtimeError::Rpc(RpcFailure::Invalid(
                "no rpc handler installed".into(),
            )));
        };
        handler(&self.local_id, call).map_err(RealtimeError::Rpc)
    }

    async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }
}

/// Produces [`LoopbackRealtime`] connections for the connection monitor.
#[derive(Clone)]
pub struct LoopbackConnector {
    hub: LoopbackHub,
    local_id: UserId,
}

impl LoopbackConnector {
    /// Creates a connector registering as `local_id` on `hub`.
    #[must_use]
    pub const fn new(hub: LoopbackHub, local_id: UserId) -> Self {
        Self { hub, local_id }
    }
}

impl Connector for LoopbackConnector {
    type Conn = LoopbackRealtime;

    fn local_id(&self) -> &UserId {
        &self.local_id
    }

    async fn connect(&self) -> Result<LoopbackRealtime, RealtimeError> {
        self.hub.connect(self.local_id.clone())
    }
}
