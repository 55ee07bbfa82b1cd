//! Hub core: shared state, WebSocket handler, client registry, topic
//! fan-out and RPC dispatch.
//!
//! The hub accepts WebSocket connections, registers clients by their
//! [`UserId`], fans `Broadcast` frames out to the other subscribers of a
//! topic, and answers thread RPCs from its [`ThreadStore`]. Every successful
//! write RPC is followed by a `Change` frame on the thread's topic so that
//! subscribed clients can update their views.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use classchat_proto::codec;
use classchat_proto::hub::{HubMessage, RpcCall, RpcFailure, RpcResponse, ThreadChange, Topic};
use classchat_proto::message::{Timestamp, UserId};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Notify, RwLock, mpsc};

use crate::store::ThreadStore;
use crate::topics::TopicRegistry;

/// Default maximum allowed broadcast payload size in bytes (64 KB).
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// A registered client connection.
struct ClientConn {
    /// Distinguishes successive connections of the same client.
    conn_id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

/// Shared hub state holding the client registry, topics and thread store.
pub struct HubState {
    /// Maps client id to the channel feeding its WebSocket writer.
    connections: RwLock<HashMap<UserId, ClientConn>>,
    next_conn_id: AtomicU64,
    /// Signalled when the last connection unregisters.
    drained: Notify,
    /// Topic subscriptions.
    pub topics: TopicRegistry,
    /// Message threads.
    pub store: ThreadStore,
    /// Maximum allowed broadcast payload size in bytes.
    max_payload_size: usize,
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

impl HubState {
    /// Creates a hub with empty registries and default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_PAYLOAD_SIZE, TopicRegistry::new(), ThreadStore::new())
    }

    /// Creates a hub with a custom payload limit, topic registry and store.
    #[must_use]
    pub fn with_config(max_payload_size: usize, topics: TopicRegistry, store: ThreadStore) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            drained: Notify::new(),
            topics,
            store,
            max_payload_size,
        }
    }

    /// Registers a client, returning the id of this connection.
    ///
    /// If the client was already connected, the old sender is replaced and
    /// its channel is closed (the previous writer task shuts down).
    pub async fn register(&self, client: &UserId, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let old = self
            .connections
            .write()
            .await
            .insert(client.clone(), ClientConn { conn_id, sender });
        if old.is_some() {
            tracing::info!(client = %client, "replaced existing connection (duplicate hello)");
        }
        conn_id
    }

    /// Removes a client connection and its subscriptions.
    ///
    /// Does nothing if the client has since reconnected on a newer
    /// connection, so a stale socket cannot tear down its replacement.
    pub async fn unregister(&self, client: &UserId, conn_id: u64) -> bool {
        let mut conns = self.connections.write().await;
        if conns.get(client).is_none_or(|c| c.conn_id != conn_id) {
            return false;
        }
        conns.remove(client);
        if conns.is_empty() {
            self.drained.notify_waiters();
        }
        drop(conns);
        let dropped = self.topics.remove_client(client).await;
        tracing::debug!(client = %client, subscriptions = dropped, "client subscriptions dropped");
        true
    }

    /// Whether the client currently has a live connection.
    pub async fn is_connected(&self, client: &UserId) -> bool {
        self.connections.read().await.contains_key(client)
    }

    async fn sender_for(&self, client: &UserId) -> Option<mpsc::UnboundedSender<Message>> {
        self.connections
            .read()
            .await
            .get(client)
            .map(|c| c.sender.clone())
    }

    /// Send a WebSocket Close frame to every connected client.
    ///
    /// Each client's reader observes the close and reports the connection as
    /// lost. Used for graceful shutdown and for exercising reconnection.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (client, conn) in conns.iter() {
            tracing::info!(client = %client, "sending close frame");
            let _ = conn.sender.send(Message::Close(None));
        }
    }

    /// Waits up to `grace` for every connection to unregister, which happens
    /// once its writer has flushed the Close frame. Returns whether the hub
    /// drained in time.
    pub async fn wait_drained(&self, grace: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.connections.read().await.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}

/// Handles an upgraded WebSocket connection for a single client.
///
/// The connection lifecycle:
/// 1. Wait for a `Hello` message.
/// 2. Register the client and send `Welcome` back.
/// 3. Enter the message loop (subscribe, broadcast, RPC).
/// 4. On disconnect, unregister the client and drop its subscriptions.
pub async fn handle_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(client) = wait_for_hello(&mut ws_receiver).await else {
        tracing::warn!("connection closed before hello");
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.register(&client, tx).await;

    let welcome = HubMessage::Welcome {
        client_id: client.clone(),
    };
    if let Err(e) = send_hub_msg(&mut ws_sender, &welcome).await {
        tracing::error!(client = %client, error = %e, "failed to send welcome");
        state.unregister(&client, conn_id).await;
        return;
    }

    tracing::info!(client = %client, conn_id, "client connected");

    let writer_client = client.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(client = %writer_client, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_client = client.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(&reader_client, &data, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(client = %reader_client, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(&client, conn_id).await;
    tracing::info!(client = %client, conn_id, "client disconnected");
}

/// Waits for the first message on the WebSocket, expecting a `Hello`.
///
/// Returns the client id if a valid `Hello` is received, or `None` if the
/// connection closes or an invalid message arrives.
async fn wait_for_hello(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<UserId> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => match codec::decode::<HubMessage>(&data) {
                Ok(HubMessage::Hello { client_id }) => {
                    if client_id.as_str().is_empty() {
                        tracing::warn!("received Hello with empty client_id");
                        return None;
                    }
                    return Some(client_id);
                }
                Ok(other) => {
                    tracing::warn!(msg = ?other, "expected Hello, got different message");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode hello message");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {
                // Skip non-binary frames (ping/pong) during the handshake.
            }
        }
    }
    None
}

/// Handles a binary WebSocket message from a registered client.
async fn handle_binary_message(client: &UserId, data: &[u8], state: &Arc<HubState>) {
    let msg = match codec::decode::<HubMessage>(data) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(client = %client, error = %e, "failed to decode message");
            return;
        }
    };

    match msg {
        HubMessage::Subscribe { topic } => handle_subscribe(client, topic, state).await,
        HubMessage::Unsubscribe { topic } => {
            let existed = state.topics.unsubscribe(client, &topic).await;
            tracing::debug!(client = %client, topic = %topic, existed, "unsubscribed");
        }
        HubMessage::Broadcast {
            topic,
            from: _,
            event,
            payload,
        } => handle_broadcast(client, topic, event, payload, state).await,
        HubMessage::Call { request_id, call } => {
            let result = dispatch_call(client, call, state).await;
            if let Err(ref e) = result {
                tracing::debug!(client = %client, request_id, error = %e, "rpc rejected");
            }
            send_to_client(state, client, &HubMessage::Reply { request_id, result }).await;
        }
        HubMessage::Hello { client_id } => {
            tracing::warn!(
                client = %client,
                new_id = %client_id,
                "received duplicate Hello from already-registered client"
            );
        }
        other => {
            tracing::warn!(client = %client, msg = ?other, "unexpected message type from client");
        }
    }
}

async fn handle_subscribe(client: &UserId, topic: Topic, state: &Arc<HubState>) {
    if let Some(owner) = topic.probe_owner()
        && owner != client.as_str()
    {
        tracing::warn!(client = %client, topic = %topic, "subscription refused: foreign probe");
        let refused = HubMessage::Refused {
            reason: format!("probe topic belongs to {owner}"),
            topic,
        };
        send_to_client(state, client, &refused).await;
        return;
    }

    if let Some(thread_id) = topic.thread_id()
        && !state.store.is_participant(thread_id, client).await
    {
        tracing::warn!(client = %client, topic = %topic, "subscription refused: not a participant");
        let refused = HubMessage::Refused {
            reason: format!("not a participant of thread {thread_id}"),
            topic,
        };
        send_to_client(state, client, &refused).await;
        return;
    }

    match state.topics.subscribe(client, &topic).await {
        Ok(()) => {
            tracing::debug!(client = %client, topic = %topic, "subscribed");
            send_to_client(state, client, &HubMessage::Subscribed { topic }).await;
        }
        Err(e) => {
            tracing::warn!(client = %client, topic = %topic, error = %e, "subscription refused");
            let refused = HubMessage::Refused {
                topic,
                reason: e.to_string(),
            };
            send_to_client(state, client, &refused).await;
        }
    }
}

async fn handle_broadcast(
    client: &UserId,
    topic: Topic,
    event: String,
    payload: Vec<u8>,
    state: &Arc<HubState>,
) {
    if payload.len() > state.max_payload_size {
        tracing::warn!(
            client = %client,
            size = payload.len(),
            max = state.max_payload_size,
            "payload exceeds size limit"
        );
        let err = HubMessage::Error {
            reason: format!(
                "payload too large: {} bytes (max {})",
                payload.len(),
                state.max_payload_size
            ),
        };
        send_to_client(state, client, &err).await;
        return;
    }

    if topic.probe_owner().is_some() {
        let err = HubMessage::Error {
            reason: format!("broadcasts are not allowed on {topic}"),
        };
        send_to_client(state, client, &err).await;
        return;
    }

    if !state.topics.is_subscribed(client, &topic).await {
        let err = HubMessage::Error {
            reason: format!("not subscribed to {topic}"),
        };
        send_to_client(state, client, &err).await;
        return;
    }

    // The sender never receives its own broadcast, and `from` is always the
    // registered id regardless of what the client claimed.
    let msg = HubMessage::Broadcast {
        topic: topic.clone(),
        from: client.clone(),
        event,
        payload,
    };
    let recipients: Vec<UserId> = state
        .topics
        .subscribers(&topic)
        .await
        .into_iter()
        .filter(|s| s != client)
        .collect();
    tracing::trace!(client = %client, topic = %topic, fanout = recipients.len(), "broadcast");
    fan_out(state, &recipients, &msg).await;
}

/// Executes an RPC on behalf of `client` and publishes the resulting change.
async fn dispatch_call(
    client: &UserId,
    call: RpcCall,
    state: &Arc<HubState>,
) -> Result<RpcResponse, RpcFailure> {
    let now = Timestamp::now();
    match call {
        RpcCall::CreateThread {
            subject,
            participants,
        } => {
            let thread_id = state
                .store
                .create_thread(client, &subject, &participants, now)
                .await?;
            tracing::info!(client = %client, thread = %thread_id, "thread created");
            Ok(RpcResponse::ThreadCreated(thread_id))
        }
        RpcCall::PostMessage {
            thread_id,
            message_id,
            sender_name,
            body,
        } => {
            let stored = state
                .store
                .post_message(thread_id, client, message_id, &sender_name, &body, now)
                .await?;
            publish_change(
                state,
                &Topic::thread(thread_id),
                ThreadChange::MessageInserted(stored.clone()),
            )
            .await;
            Ok(RpcResponse::Posted(stored))
        }
        RpcCall::ListMessages { thread_id } => state
            .store
            .messages(thread_id, client)
            .await
            .map(RpcResponse::Messages),
        RpcCall::MarkMessagesDelivered { thread_id } => {
            let message_ids = state.store.mark_delivered(thread_id, client, now).await?;
            if !message_ids.is_empty() {
                publish_change(
                    state,
                    &Topic::thread(thread_id),
                    ThreadChange::MessagesDelivered {
                        thread_id,
                        recipient: client.clone(),
                        message_ids: message_ids.clone(),
                        at: now,
                    },
                )
                .await;
            }
            Ok(RpcResponse::Marked(message_ids))
        }
        RpcCall::MarkMessagesRead { thread_id } => {
            let message_ids = state.store.mark_read(thread_id, client, now).await?;
            if !message_ids.is_empty() {
                publish_change(
                    state,
                    &Topic::thread(thread_id),
                    ThreadChange::MessagesRead {
                        thread_id,
                        recipient: client.clone(),
                        message_ids: message_ids.clone(),
                        at: now,
                    },
                )
                .await;
            }
            Ok(RpcResponse::Marked(message_ids))
        }
        RpcCall::ThreadsSummary => Ok(RpcResponse::Summaries(state.store.summaries(client).await)),
    }
}

/// Sends a row change to every subscriber of the topic, the author included.
async fn publish_change(state: &Arc<HubState>, topic: &Topic, change: ThreadChange) {
    let recipients = state.topics.subscribers(topic).await;
    let msg = HubMessage::Change {
        topic: topic.clone(),
        change,
    };
    fan_out(state, &recipients, &msg).await;
}

async fn fan_out(state: &Arc<HubState>, recipients: &[UserId], msg: &HubMessage) {
    if recipients.is_empty() {
        return;
    }
    let bytes = match codec::encode(msg) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode fan-out message");
            return;
        }
    };
    for recipient in recipients {
        if let Some(sender) = state.sender_for(recipient).await
            && sender.send(Message::Binary(bytes.clone().into())).is_err()
        {
            tracing::debug!(recipient = %recipient, "fan-out target writer gone");
        }
    }
}

/// Sends a hub message to a registered client via its channel.
async fn send_to_client(state: &Arc<HubState>, client: &UserId, msg: &HubMessage) {
    if let Some(sender) = state.sender_for(client).await
        && let Ok(bytes) = codec::encode(msg)
    {
        let _ = sender.send(Message::Binary(bytes.into()));
    }
}

/// Encodes and sends a hub message directly on a WebSocket sender.
async fn send_hub_msg(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    msg: &HubMessage,
) -> Result<(), String> {
    let bytes = codec::encode(msg).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the hub on the given address and returns the bound address and a
/// join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(HubState::new())).await
}

/// Starts the hub with a pre-configured [`HubState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<HubState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "hub server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<HubState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
