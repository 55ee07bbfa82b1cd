//! WebSocket connection to a `classchat-hub`.
//!
//! Implements the [`Realtime`] trait over a single WebSocket. A background
//! reader task routes frames: subscription acks and RPC replies go to the
//! callers waiting for them, `Broadcast` and `Change` frames go to the
//! per-topic [`Subscription`] channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use classchat_proto::codec;
use classchat_proto::hub::{HubMessage, RpcCall, RpcFailure, RpcResponse, Topic};
use classchat_proto::message::UserId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Connector, InboundEvent, Realtime, RealtimeError, Subscription};

type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

type ReplySender = oneshot::Sender<Result<RpcResponse, RpcFailure>>;
type AckSender = oneshot::Sender<Result<(), String>>;

/// Timeouts applied by [`WsRealtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsTimeouts {
    /// Opening the WebSocket.
    pub connect: Duration,
    /// Waiting for `Welcome` after `Hello`.
    pub hello: Duration,
    /// Waiting for a subscription ack or an RPC reply.
    pub rpc: Duration,
}

impl Default for WsTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            hello: Duration::from_secs(5),
            rpc: Duration::from_secs(10),
        }
    }
}

/// Routing tables shared with the reader task.
#[derive(Default)]
struct Routes {
    topics: parking_lot::Mutex<HashMap<Topic, mpsc::UnboundedSender<InboundEvent>>>,
    acks: parking_lot::Mutex<HashMap<Topic, AckSender>>,
    replies: parking_lot::Mutex<HashMap<u64, ReplySender>>,
}

impl Routes {
    fn deliver(&self, topic: &Topic, event: InboundEvent) {
        let mut topics = self.topics.lock();
        let gone = topics.get(topic).is_some_and(|tx| tx.send(event).is_err());
        if gone {
            topics.remove(topic);
        }
    }

    /// Drops every route so waiting callers and subscribers observe the close.
    fn clear(&self) {
        self.topics.lock().clear();
        self.acks.lock().clear();
        self.replies.lock().clear();
    }
}

/// A live WebSocket connection to the hub.
///
/// Created via [`WsRealtime::connect`], which opens the socket, performs the
/// hello handshake and spawns the background reader. Dropping the value
/// closes the connection.
pub struct WsRealtime {
    local_id: UserId,
    hub_url: String,
    ws_sender: Arc<Mutex<WsSender>>,
    routes: Arc<Routes>,
    next_request_id: AtomicU64,
    rpc_timeout: Duration,
    connected: watch::Receiver<bool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WsRealtime {
    /// Connect with default timeouts.
    ///
    /// # Errors
    ///
    /// See [`WsRealtime::connect_with`].
    pub async fn connect(hub_url: &str, local_id: UserId) -> Result<Self, RealtimeError> {
        Self::connect_with(hub_url, local_id, WsTimeouts::default()).await
    }

    /// Connect to the hub and register as `local_id`.
    ///
    /// 1. Validates the URL and opens the WebSocket (`connect` timeout)
    /// 2. Sends `Hello` and waits for `Welcome` (`hello` timeout)
    /// 3. Spawns the background reader task
    ///
    /// # Errors
    ///
    /// - [`RealtimeError::Unreachable`] if the URL is invalid or nothing listens there.
    /// - [`RealtimeError::Timeout`] if connecting or the handshake times out.
    /// - [`RealtimeError::Rejected`] if the hub answers the hello with an error.
    /// - [`RealtimeError::ConnectionClosed`] if the hub hangs up during the handshake.
    pub async fn connect_with(
        hub_url: &str,
        local_id: UserId,
        timeouts: WsTimeouts,
    ) -> Result<Self, RealtimeError> {
        validate_hub_url(hub_url)?;

        let (ws_stream, _response) = tokio::time::timeout(timeouts.connect, connect_async(hub_url))
            .await
            .map_err(|_| {
                tracing::warn!(url = hub_url, "hub WebSocket connect timed out");
                RealtimeError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = hub_url, err = %e, "hub WebSocket connect failed");
                map_ws_connect_error(hub_url, e)
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let hello = codec::encode(&HubMessage::Hello {
            client_id: local_id.clone(),
        })?;
        ws_sender
            .send(Message::Binary(hello.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "failed to send Hello");
                RealtimeError::ConnectionClosed
            })?;

        let welcome = tokio::time::timeout(timeouts.hello, ws_reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url = hub_url, "hub hello acknowledgment timed out");
                RealtimeError::Timeout
            })?;

        match welcome {
            Some(Ok(Message::Binary(data))) => match codec::decode::<HubMessage>(&data)? {
                HubMessage::Welcome { client_id } => {
                    tracing::info!(client = %client_id, url = hub_url, "connected to hub");
                }
                HubMessage::Error { reason } => {
                    tracing::warn!(reason = %reason, "hub rejected hello");
                    return Err(RealtimeError::Rejected(reason));
                }
                other => {
                    tracing::warn!(?other, "unexpected hub response during hello");
                    return Err(RealtimeError::Rejected(
                        "unexpected response during hello".into(),
                    ));
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                tracing::warn!("hub closed connection during hello");
                return Err(RealtimeError::ConnectionClosed);
            }
            Some(Ok(_)) => {
                return Err(RealtimeError::Rejected(
                    "unexpected non-binary frame during hello".into(),
                ));
            }
            Some(Err(e)) => {
                tracing::warn!(err = %e, "WebSocket error during hello");
                return Err(RealtimeError::ConnectionClosed);
            }
        }

        let routes = Arc::new(Routes::default());
        let (connected_tx, connected_rx) = watch::channel(true);
        let reader_handle = tokio::spawn(reader_loop(ws_reader, Arc::clone(&routes), connected_tx));

        Ok(Self {
            local_id,
            hub_url: hub_url.to_string(),
            ws_sender: Arc::new(Mutex::new(ws_sender)),
            routes,
            next_request_id: AtomicU64::new(1),
            rpc_timeout: timeouts.rpc,
            connected: connected_rx,
            reader_handle,
        })
    }

    /// The hub URL this connection was opened against.
    #[must_use]
    pub fn hub_url(&self) -> &str {
        &self.hub_url
    }

    /// Send a Close frame to the hub.
    pub async fn close(&self) {
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.send(Message::Close(None)).await {
            tracing::debug!(err = %e, "close frame not sent");
        }
    }

    async fn send_frame(&self, msg: &HubMessage) -> Result<(), RealtimeError> {
        if !self.is_connected() {
            return Err(RealtimeError::ConnectionClosed);
        }
        let bytes = codec::encode(msg)?;
        let mut sender = self.ws_sender.lock().await;
        sender
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "hub send failed");
                RealtimeError::ConnectionClosed
            })
    }
}

impl WsRealtime {
    async fn await_subscribe_ack(
        &self,
        topic: &Topic,
        ack_rx: oneshot::Receiver<Result<(), String>>,
    ) -> Result<(), RealtimeError> {
        self.send_frame(&HubMessage::Subscribe {
            topic: topic.clone(),
        })
        .await?;
        match tokio::time::timeout(self.rpc_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(RealtimeError::Rejected(reason)),
            Ok(Err(_)) => Err(RealtimeError::ConnectionClosed),
            Err(_) => Err(RealtimeError::Timeout),
        }
    }
}

impl Drop for WsRealtime {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

impl Realtime for WsRealtime {
    fn local_id(&self) -> &UserId {
        &self.local_id
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, RealtimeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        // Route before asking, so events that race the ack are not lost.
        self.routes.topics.lock().insert(topic.clone(), tx);
        self.routes.acks.lock().insert(topic.clone(), ack_tx);

        let result = self.await_subscribe_ack(topic, ack_rx).await;

        match result {
            Ok(()) => {
                tracing::debug!(topic = %topic, "subscribed");
                Ok(Subscription::new(topic.clone(), rx))
            }
            Err(e) => {
                self.routes.acks.lock().remove(topic);
                self.routes.topics.lock().remove(topic);
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), RealtimeError> {
        self.routes.topics.lock().remove(topic);
        self.send_frame(&HubMessage::Unsubscribe {
            topic: topic.clone(),
        })
        .await
    }

    async fn broadcast(
        &self,
        topic: &Topic,
        event: &str,
        payload: Vec<u8>,
    ) -> Result<(), RealtimeError> {
        self.send_frame(&HubMessage::Broadcast {
            topic: topic.clone(),
            from: self.local_id.clone(),
            event: event.to_string(),
            payload,
        })
        .await
    }

    async fn call(&self, call: RpcCall) -> Result<RpcResponse, RealtimeError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.routes.replies.lock().insert(request_id, reply_tx);

        if let Err(e) = self.send_frame(&HubMessage::Call { request_id, call }).await {
            self.routes.replies.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.rpc_timeout, reply_rx).await {
            Ok(Ok(result)) => result.map_err(RealtimeError::Rpc),
            Ok(Err(_)) => Err(RealtimeError::ConnectionClosed),
            Err(_) => {
                self.routes.replies.lock().remove(&request_id);
                tracing::warn!(request_id, "rpc reply timed out");
                Err(RealtimeError::Timeout)
            }
        }
    }

    async fn closed(&self) {
        let mut rx = self.connected.clone();
        let _ = rx.wait_for(|up| !*up).await;
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

/// Background task that reads hub frames and routes them.
///
/// Malformed frames are logged and skipped; the task does not disconnect on
/// bad data. On exit every route is dropped so callers waiting on an ack or
/// reply observe [`RealtimeError::ConnectionClosed`].
async fn reader_loop(mut ws_reader: WsReader, routes: Arc<Routes>, connected: watch::Sender<bool>) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => match codec::decode::<HubMessage>(&data) {
                Ok(HubMessage::Broadcast {
                    topic,
                    from,
                    event,
                    payload,
                }) => routes.deliver(
                    &topic,
                    InboundEvent::Broadcast {
                        from,
                        event,
                        payload,
                    },
                ),
                Ok(HubMessage::Change { topic, change }) => {
                    routes.deliver(&topic, InboundEvent::Change(change));
                }
                Ok(HubMessage::Subscribed { topic }) => {
                    if let Some(ack) = routes.acks.lock().remove(&topic) {
                        let _ = ack.send(Ok(()));
                    }
                }
                Ok(HubMessage::Refused { topic, reason }) => {
                    tracing::warn!(topic = %topic, reason = %reason, "subscription refused");
                    if let Some(ack) = routes.acks.lock().remove(&topic) {
                        let _ = ack.send(Err(reason));
                    }
                }
                Ok(HubMessage::Reply { request_id, result }) => {
                    if let Some(reply) = routes.replies.lock().remove(&request_id) {
                        let _ = reply.send(result);
                    } else {
                        tracing::debug!(request_id, "reply for unknown request");
                    }
                }
                Ok(HubMessage::Error { reason }) => {
                    tracing::warn!(reason = %reason, "hub error");
                }
                Ok(other) => {
                    tracing::debug!(?other, "unexpected hub message type");
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed hub frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("hub WebSocket closed by server");
                break;
            }
            Ok(_) => {
                // Ping, pong, text and raw frames carry nothing for us.
            }
            Err(e) => {
                tracing::warn!(err = %e, "hub WebSocket read error");
                break;
            }
        }
    }
    let _ = connected.send(false);
    routes.clear();
    tracing::info!("hub reader task exiting");
}

/// Produces [`WsRealtime`] connections for the connection monitor.
#[derive(Debug, Clone)]
pub struct WsConnector {
    hub_url: String,
    local_id: UserId,
    timeouts: WsTimeouts,
}

impl WsConnector {
    /// Creates a connector for `hub_url` registering as `local_id`.
    #[must_use]
    pub fn new(hub_url: impl Into<String>, local_id: UserId, timeouts: WsTimeouts) -> Self {
        Self {
            hub_url: hub_url.into(),
            local_id,
            timeouts,
        }
    }
}

impl Connector for WsConnector {
    type Conn = WsRealtime;

    fn local_id(&self) -> &UserId {
        &self.local_id
    }

    async fn connect(&self) -> Result<WsRealtime, RealtimeError> {
        WsRealtime::connect_with(&self.hub_url, self.local_id.clone(), self.timeouts).await
    }
}

/// Rejects anything that is not a `ws://` or `wss://` URL with a host.
fn validate_hub_url(hub_url: &str) -> Result<(), RealtimeError> {
    let parsed = url::Url::parse(hub_url)
        .map_err(|e| RealtimeError::Unreachable(format!("{hub_url} ({e})")))?;
    match parsed.scheme() {
        "ws" | "wss" if parsed.host().is_some() => Ok(()),
        "ws" | "wss" => Err(RealtimeError::Unreachable(format!("{hub_url} (no host)"))),
        scheme => Err(RealtimeError::Unreachable(format!(
            "{hub_url} (unsupported scheme {scheme})"
        ))),
    }
}

/// Map a `tokio_tungstenite` connection error to a [`RealtimeError`].
fn map_ws_connect_error(
    hub_url: &str,
    err: tokio_tungstenite::tungstenite::Error,
) -> RealtimeError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) {
                RealtimeError::Unreachable(hub_url.to_string())
            } else {
                RealtimeError::Io(io_err)
            }
        }
        WsError::Http(response) => RealtimeError::Rejected(format!(
            "hub HTTP error: status {}",
            response.status()
        )),
        other => RealtimeError::Io(std::io::Error::other(format!(
            "hub connection error: {other}"
        ))),
    }
}
