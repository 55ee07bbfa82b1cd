//! Realtime layer abstraction for `ClassChat`.
//!
//! Defines the [`Realtime`] trait that every hub connection satisfies.
//! Concrete implementations include:
//! - [`ws::WsRealtime`]: WebSocket connection to a `classchat-hub`
//! - [`loopback::LoopbackRealtime`]: in-process hub for testing
//! - [`crate::connection::ConnectionHandle`]: a self-healing wrapper that
//!   keeps subscriptions alive across reconnects
//!
//! A [`Connector`] produces fresh connections; the connection monitor uses
//! one to reconnect after failures.

pub mod loopback;
pub mod ws;

use std::future::Future;

use classchat_proto::codec::CodecError;
use classchat_proto::hub::{RpcCall, RpcFailure, RpcResponse, ThreadChange, Topic};
use classchat_proto::message::UserId;
use tokio::sync::mpsc;

/// Errors that can occur during realtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// The connection to the hub has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("realtime operation timed out")]
    Timeout,

    /// The hub could not be reached.
    #[error("hub {0} is unreachable")]
    Unreachable(String),

    /// The hub refused the request (handshake or subscription).
    #[error("rejected by hub: {0}")]
    Rejected(String),

    /// The hub answered an RPC with a failure.
    #[error("rpc failed: {0}")]
    Rpc(#[from] RpcFailure),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("realtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An event delivered to the subscribers of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Application broadcast from another client.
    Broadcast {
        /// Hub-attested sender.
        from: UserId,
        /// Event name (e.g. `typing`).
        event: String,
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// Row change published by the hub.
    Change(ThreadChange),
}

/// Receiving end of a topic subscription.
///
/// `recv` returns `None` once the subscription is torn down (unsubscribed,
/// replaced by a newer subscription to the same topic, or the connection
/// went away).
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    rx: mpsc::UnboundedReceiver<InboundEvent>,
}

impl Subscription {
    /// Wraps a receiver fed by a realtime implementation.
    #[must_use]
    pub const fn new(topic: Topic, rx: mpsc::UnboundedReceiver<InboundEvent>) -> Self {
        Self { topic, rx }
    }

    /// The topic this subscription listens on.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Waits for the next event on the topic.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }

    /// Returns an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.rx.try_recv().ok()
    }
}

/// Async interface to the realtime hub.
///
/// Broadcasts are fire-and-forget and never echoed back to the sender.
/// Subscribing to a topic the caller is already subscribed to replaces the
/// previous [`Subscription`].
pub trait Realtime: Send + Sync {
    /// Identity this connection registered with.
    fn local_id(&self) -> &UserId;

    /// Join a topic. Resolves once the hub acknowledged the subscription.
    fn subscribe(
        &self,
        topic: &Topic,
    ) -> impl Future<Output = Result<Subscription, RealtimeError>> + Send;

    /// Leave a topic.
    fn unsubscribe(&self, topic: &Topic) -> impl Future<Output = Result<(), RealtimeError>> + Send;

    /// Publish an event to every other subscriber of `topic`.
    fn broadcast(
        &self,
        topic: &Topic,
        event: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), RealtimeError>> + Send;

    /// Invoke a hub procedure and wait for its reply.
    fn call(
        &self,
        call: RpcCall,
    ) -> impl Future<Output = Result<RpcResponse, RealtimeError>> + Send;

    /// Resolves once the connection is closed for good.
    fn closed(&self) -> impl Future<Output = ()> + Send;

    /// Whether the connection is currently usable.
    fn is_connected(&self) -> bool;
}

/// Factory for hub connections, used to (re)connect.
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced.
    type Conn: Realtime + 'static;

    /// Identity the produced connections register with.
    fn local_id(&self) -> &UserId;

    /// Open a new connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Conn, RealtimeError>> + Send;
}

/// Forwards events from a connection-level subscription into a longer-lived
/// channel until either side goes away.
pub(crate) async fn forward(mut sub: Subscription, tx: mpsc::UnboundedSender<InboundEvent>) {
    while let Some(event) = sub.recv().await {
        if tx.send(event).is_err() {
            break;
        }
    }
    tracing::trace!(topic = %sub.topic(), "subscription forwarder exiting");
}

/// Drains a subscription whose events carry no meaning, such as the
/// connection probe, so its queue never grows.
pub(crate) async fn discard(mut sub: Subscription) {
    while let Some(event) = sub.recv().await {
        tracing::trace!(topic = %sub.topic(), ?event, "discarding event");
    }
}
