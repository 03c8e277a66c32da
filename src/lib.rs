//! Server-side broker for the Foxglove WebSocket protocol described in
//! <https://github.com/foxglove/ws-protocol>.
//!
//! The broker advertises server-owned channels to every connected client,
//! fans binary messages out to subscribers, accepts client-published
//! channels, answers service calls and fronts a parameter store owned by the
//! embedding application. Embedders drive it through [`FoxgloveServer`] and
//! observe it through a [`ServerListener`].
//!
//! The protocol does not fix a data scheme for messages. For Foxglove to
//! understand them it makes sense to follow the well-known serialization
//! schemes listed at <https://mcap.dev/spec/registry>.
//!
//! # Example
//!
//! ```no_run
//! use foxglove_server::{ChannelSpec, FoxgloveServer, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = FoxgloveServer::new("example server", ServerOptions::default());
//!     server.start(([127, 0, 0, 1], 8765)).await?;
//!     let chan_id = server
//!         .add_channel(ChannelSpec::new(
//!             "/data",
//!             "json",
//!             "ExampleMsg",
//!             r#"{"type":"object","properties":{"msg":{"type":"string"}}}"#,
//!         ))
//!         .await?;
//!     server
//!         .send_message(chan_id, 0, br#"{"msg":"Hello!"}"#)
//!         .await?;
//!     server.close();
//!     server.wait_closed().await;
//!     Ok(())
//! }
//! ```

mod client_state;
mod framing;
mod listener;
mod protocol_types;

pub use listener::ServerListener;
pub use protocol_types::{
    Capability, Channel, ChannelId, ClientChannel, ClientChannelId, Parameter, ParameterValue,
    Service, ServiceId, ServiceMessageDefinition, StatusLevel, SubscriptionId,
};

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, bail, Context};
use base64::{engine::general_purpose, Engine as _};
use futures_util::{SinkExt, StreamExt, TryFutureExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;
use warp::{
    ws::{Message, WebSocket},
    Filter,
};

use client_state::ClientState;
use framing::ClientFrame;
use protocol_types::{ClientMessage, ServerMessage};

const SUBPROTOCOL: &str = "foxglove.websocket.v1";

/// Upper bound on queued outbound messages per connection. Data frames for a
/// client that cannot keep up are dropped once its queue is full.
const SEND_QUEUE_CAPACITY: usize = 32;

/// Wrapper around different types of schema payloads.
/// Binary descriptors get base64 encoded.
pub struct SchemaData(String);

impl From<String> for SchemaData {
    fn from(content: String) -> Self {
        SchemaData(content)
    }
}

impl From<&str> for SchemaData {
    fn from(content: &str) -> Self {
        SchemaData(content.to_owned())
    }
}

impl From<Vec<u8>> for SchemaData {
    fn from(data: Vec<u8>) -> Self {
        SchemaData(general_purpose::STANDARD_NO_PAD.encode(data))
    }
}

impl From<&[u8]> for SchemaData {
    fn from(data: &[u8]) -> Self {
        SchemaData(general_purpose::STANDARD_NO_PAD.encode(data))
    }
}

/// Definition of a channel to advertise, before an id is assigned.
#[derive(Clone, Debug)]
pub struct ChannelSpec {
    topic: String,
    encoding: String,
    schema_name: String,
    schema: String,
    schema_encoding: Option<String>,
}

impl ChannelSpec {
    /// Describes a new channel.
    ///
    /// # Arguments
    ///
    /// * `topic` - Name of the topic of this channel.
    /// * `encoding` - Message encoding on the channel.
    /// * `schema_name` - Name of the schema.
    /// * `schema` - Schema describing the message format.
    pub fn new(
        topic: &str,
        encoding: &str,
        schema_name: &str,
        schema: impl Into<SchemaData>,
    ) -> Self {
        Self {
            topic: topic.to_owned(),
            encoding: encoding.to_owned(),
            schema_name: schema_name.to_owned(),
            schema: schema.into().0,
            schema_encoding: None,
        }
    }

    /// Sets the schema encoding. Needed when it can't be deduced from the
    /// message encoding.
    pub fn with_schema_encoding(mut self, schema_encoding: &str) -> Self {
        self.schema_encoding = Some(schema_encoding.to_owned());
        self
    }
}

/// Definition of a service to advertise, before an id is assigned. At least
/// one of `request`/`request_schema` and one of `response`/`response_schema`
/// must be filled in.
#[derive(Clone, Debug, Default)]
pub struct ServiceSpec {
    pub name: String,
    pub service_type: String,
    pub request: Option<ServiceMessageDefinition>,
    pub request_schema: Option<String>,
    pub response: Option<ServiceMessageDefinition>,
    pub response_schema: Option<String>,
}

/// Optional server configuration reported in `serverInfo`.
#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    pub capabilities: Vec<Capability>,
    pub supported_encodings: Option<Vec<String>>,
    pub metadata: Option<HashMap<String, String>>,
    pub session_id: Option<String>,
}

#[derive(Debug)]
struct Client {
    id: Uuid,
    tx: mpsc::Sender<Message>,
    state: ClientState,
}

struct ServerState {
    name: String,
    capabilities: Vec<Capability>,
    supported_encodings: Option<Vec<String>>,
    metadata: Option<HashMap<String, String>>,
    session_id: RwLock<Option<String>>,
    clients: RwLock<HashMap<Uuid, Client>>,
    channels: RwLock<HashMap<ChannelId, Channel>>,
    next_channel_id: AtomicU32,
    services: RwLock<HashMap<ServiceId, Service>>,
    next_service_id: AtomicU32,
    listener: RwLock<Option<Arc<dyn ServerListener>>>,
    shutdown: watch::Sender<bool>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

/// The broker. Tracks connected clients and their subscriptions, owns the
/// channel and service tables, and fans messages out. Cheap to clone; all
/// clones drive the same server.
#[derive(Clone)]
pub struct FoxgloveServer {
    state: Arc<ServerState>,
}

impl FoxgloveServer {
    /// Creates a new broker with the given display name.
    pub fn new(name: &str, options: ServerOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(ServerState {
                name: name.to_owned(),
                capabilities: options.capabilities,
                supported_encodings: options.supported_encodings,
                metadata: options.metadata,
                session_id: RwLock::new(options.session_id),
                clients: RwLock::default(),
                channels: RwLock::default(),
                next_channel_id: AtomicU32::new(0),
                services: RwLock::default(),
                next_service_id: AtomicU32::new(0),
                listener: RwLock::new(None),
                shutdown,
                serve_task: Mutex::new(None),
            }),
        }
    }

    /// Installs the listener that receives subscription edges, client
    /// publishes, service requests and parameter access.
    pub async fn set_listener(&self, listener: Arc<dyn ServerListener>) {
        *self.state.listener.write().await = Some(listener);
    }

    /// Binds the listening socket and spawns the accept loop. Returns the
    /// bound address, which is useful with an ephemeral port.
    pub async fn start(&self, addr: impl Into<SocketAddr>) -> anyhow::Result<SocketAddr> {
        let addr = addr.into();
        let route = self.route();
        let mut shutdown_rx = self.state.shutdown.subscribe();
        let (local_addr, serve) = warp::serve(route)
            .try_bind_with_graceful_shutdown(addr, async move {
                if *shutdown_rx.borrow() {
                    return;
                }
                let _ = shutdown_rx.changed().await;
            })
            .context("Failed to bind server socket")?;
        let task = tokio::spawn(serve);
        *self.state.serve_task.lock().await = Some(task);
        log::info!("Server listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Signals the accept loop and every session to stop. Does not wait; see
    /// [`FoxgloveServer::wait_closed`].
    pub fn close(&self) {
        log::info!("Shutting down...");
        let _ = self.state.shutdown.send(true);
    }

    /// Waits until the accept loop has terminated.
    pub async fn wait_closed(&self) {
        let task = self.state.serve_task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                log::debug!("Accept loop ended abnormally: {}", err);
            }
        }
    }

    /// Registers a channel and advertises it to every connected client.
    /// Clients that connect mid-call pick it up from their initial snapshot.
    pub async fn add_channel(&self, spec: ChannelSpec) -> anyhow::Result<ChannelId> {
        let id = self.state.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let channel = Channel {
            id,
            topic: spec.topic,
            encoding: spec.encoding,
            schema_name: spec.schema_name,
            schema: spec.schema,
            schema_encoding: spec.schema_encoding,
        };
        log::debug!("Advertising new channel {} on {}", id, channel.topic);
        let message = ServerMessage::Advertise {
            channels: vec![channel.clone()],
        };
        // The table insert and the handle copy share a critical section, so a
        // concurrently joining client sees the channel either in its snapshot
        // or in this broadcast, never in both and never in neither.
        let handles = {
            let mut channels = self.state.channels.write().await;
            let clients = self.state.clients.read().await;
            channels.insert(id, channel);
            handles_of(&clients)
        };
        self.send_to_handles(handles, &message).await?;
        Ok(id)
    }

    /// Removes a channel. Every session drops its subscription silently; the
    /// removal is server driven, so no unsubscribe edges fire.
    pub async fn remove_channel(&self, chan_id: ChannelId) -> anyhow::Result<()> {
        let handles = {
            let mut channels = self.state.channels.write().await;
            if channels.remove(&chan_id).is_none() {
                bail!("Channel {} does not exist", chan_id);
            }
            let mut clients = self.state.clients.write().await;
            for client in clients.values_mut() {
                client.state.remove_channel(chan_id);
            }
            handles_of(&clients)
        };
        self.send_to_handles(
            handles,
            &ServerMessage::Unadvertise {
                channel_ids: vec![chan_id],
            },
        )
        .await
    }

    /// Registers a service. It is advertised to clients only when the
    /// `services` capability is configured, but tracked either way.
    pub async fn add_service(&self, spec: ServiceSpec) -> anyhow::Result<ServiceId> {
        if spec.request.is_none() && spec.request_schema.is_none() {
            bail!("Invalid service definition: either 'request' or 'requestSchema' must be defined");
        }
        if spec.response.is_none() && spec.response_schema.is_none() {
            bail!(
                "Invalid service definition: either 'response' or 'responseSchema' must be defined"
            );
        }
        let id = self.state.next_service_id.fetch_add(1, Ordering::Relaxed);
        let service = Service {
            id,
            name: spec.name,
            service_type: spec.service_type,
            request: spec.request,
            request_schema: spec.request_schema,
            response: spec.response,
            response_schema: spec.response_schema,
        };
        log::debug!("Advertising new service {} ({})", id, service.name);
        let message = ServerMessage::AdvertiseServices {
            services: vec![service.clone()],
        };
        let handles = {
            let mut services = self.state.services.write().await;
            let clients = self.state.clients.read().await;
            services.insert(id, service);
            handles_of(&clients)
        };
        if self.state.capabilities.contains(&Capability::Services) {
            self.send_to_handles(handles, &message).await?;
        }
        Ok(id)
    }

    /// Removes a service and withdraws its advertisement.
    pub async fn remove_service(&self, service_id: ServiceId) -> anyhow::Result<()> {
        let handles = {
            let mut services = self.state.services.write().await;
            if services.remove(&service_id).is_none() {
                bail!("Service {} does not exist", service_id);
            }
            let clients = self.state.clients.read().await;
            handles_of(&clients)
        };
        if self.state.capabilities.contains(&Capability::Services) {
            self.send_to_handles(
                handles,
                &ServerMessage::UnadvertiseServices {
                    service_ids: vec![service_id],
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Sends a message on a channel to every subscribed client, addressed by
    /// each client's own subscription id.
    ///
    /// # Arguments
    ///
    /// * `chan_id` - Channel to publish on.
    /// * `timestamp_ns` - Point in time this message was published/created/logged.
    /// * `payload` - Data buffer to publish.
    pub async fn send_message(
        &self,
        chan_id: ChannelId,
        timestamp_ns: u64,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let subscribers: Vec<(Uuid, mpsc::Sender<Message>, SubscriptionId)> = self
            .state
            .clients
            .read()
            .await
            .values()
            .filter_map(|client| {
                client
                    .state
                    .subscription_for_channel(chan_id)
                    .map(|sub_id| (client.id, client.tx.clone(), sub_id))
            })
            .collect();
        for (client_id, tx, sub_id) in subscribers {
            let frame = framing::message_data(sub_id, timestamp_ns, payload)?;
            if let Err(err) = tx.try_send(Message::binary(frame)) {
                log::debug!("Dropping message for client {}: {}", client_id, err);
            }
        }
        Ok(())
    }

    /// Broadcasts the given timestamp to every client as a `TIME` frame.
    pub async fn broadcast_time(&self, timestamp_ns: u64) -> anyhow::Result<()> {
        let frame = framing::time_data(timestamp_ns)?;
        for (client_id, tx) in self.sender_handles().await {
            if tx.send(Message::binary(frame.clone())).await.is_err() {
                log::debug!("Client {} is gone; dropping time broadcast", client_id);
            }
        }
        Ok(())
    }

    /// Broadcasts a status message to every client.
    pub async fn send_status(
        &self,
        level: StatusLevel,
        message: &str,
        id: Option<String>,
    ) -> anyhow::Result<()> {
        self.broadcast(&ServerMessage::Status {
            level,
            message: message.to_owned(),
            id,
        })
        .await
    }

    /// Asks every client to drop previously sent status messages by id.
    pub async fn remove_status(&self, status_ids: Vec<String>) -> anyhow::Result<()> {
        self.broadcast(&ServerMessage::RemoveStatus { status_ids }).await
    }

    /// Pushes updated parameter values to the clients subscribed to them.
    /// Each client only receives the parameters it asked for.
    pub async fn update_parameters(&self, parameters: Vec<Parameter>) -> anyhow::Result<()> {
        let updates: Vec<(mpsc::Sender<Message>, Vec<Parameter>)> = self
            .state
            .clients
            .read()
            .await
            .values()
            .filter_map(|client| {
                let of_interest: Vec<Parameter> = parameters
                    .iter()
                    .filter(|param| client.state.is_subscribed_to_param(&param.name))
                    .cloned()
                    .collect();
                if of_interest.is_empty() {
                    None
                } else {
                    Some((client.tx.clone(), of_interest))
                }
            })
            .collect();
        for (tx, parameters) in updates {
            enqueue_json(&tx, &ServerMessage::ParameterValues {
                parameters,
                id: None,
            })
            .await?;
        }
        Ok(())
    }

    /// Replaces the session id and re-sends `serverInfo` to every client.
    pub async fn reset_session_id(&self, session_id: Option<String>) -> anyhow::Result<()> {
        *self.state.session_id.write().await = session_id;
        let message = server_info(&self.state).await;
        self.broadcast(&message).await
    }

    async fn broadcast(&self, message: &ServerMessage) -> anyhow::Result<()> {
        let handles = self.sender_handles().await;
        self.send_to_handles(handles, message).await
    }

    async fn send_to_handles(
        &self,
        handles: Vec<(Uuid, mpsc::Sender<Message>)>,
        message: &ServerMessage,
    ) -> anyhow::Result<()> {
        let text = serde_json::to_string(message)?;
        for (client_id, tx) in handles {
            if tx.send(Message::text(text.clone())).await.is_err() {
                log::debug!("Client {} is gone; dropping control message", client_id);
            }
        }
        Ok(())
    }

    /// Copies the per-client send handles so no lock is held across sends.
    async fn sender_handles(&self) -> Vec<(Uuid, mpsc::Sender<Message>)> {
        let clients = self.state.clients.read().await;
        handles_of(&clients)
    }

    fn route(
        &self,
    ) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let state = self.state.clone();
        let state = warp::any().map(move || state.clone());
        warp::path::end().and(
            warp::ws()
                .and(state)
                .and(warp::addr::remote())
                .map(
                    |ws: warp::ws::Ws, state: Arc<ServerState>, remote: Option<SocketAddr>| {
                        ws.on_upgrade(move |socket| client_connected(socket, remote, state))
                    },
                )
                .map(|reply| {
                    warp::reply::with_header(reply, "Sec-WebSocket-Protocol", SUBPROTOCOL)
                }),
        )
    }
}

async fn server_info(state: &ServerState) -> ServerMessage {
    ServerMessage::ServerInfo {
        name: state.name.clone(),
        capabilities: state.capabilities.clone(),
        supported_encodings: state.supported_encodings.clone(),
        metadata: state.metadata.clone(),
        session_id: state.session_id.read().await.clone(),
    }
}

fn handles_of(clients: &HashMap<Uuid, Client>) -> Vec<(Uuid, mpsc::Sender<Message>)> {
    clients
        .values()
        .map(|client| (client.id, client.tx.clone()))
        .collect()
}

fn any_subscribed(clients: &HashMap<Uuid, Client>, chan_id: ChannelId) -> bool {
    clients
        .values()
        .any(|client| client.state.subscription_for_channel(chan_id).is_some())
}

fn any_param_subscriber(clients: &HashMap<Uuid, Client>, name: &str) -> bool {
    clients
        .values()
        .any(|client| client.state.is_subscribed_to_param(name))
}

async fn enqueue_json(tx: &mpsc::Sender<Message>, message: &ServerMessage) -> anyhow::Result<()> {
    let text = serde_json::to_string(message)?;
    if tx.send(Message::text(text)).await.is_err() {
        log::debug!("Client is gone; dropping message");
    }
    Ok(())
}

async fn enqueue_status(
    tx: &mpsc::Sender<Message>,
    level: StatusLevel,
    message: String,
    id: Option<String>,
) -> anyhow::Result<()> {
    enqueue_json(tx, &ServerMessage::Status { level, message, id }).await
}

async fn client_connected(ws: WebSocket, remote: Option<SocketAddr>, state: Arc<ServerState>) {
    let client_id = Uuid::new_v4();
    let peer = remote
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| format!("client {}", client_id));
    log::info!("Connection to {} opened", peer);

    let (mut user_ws_tx, mut user_ws_rx) = ws.split();
    let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
    let mut rx = ReceiverStream::new(rx);

    // The only task that writes to the socket; everything else enqueues.
    // Messages already queued when a subscription goes away are still
    // written; the receiver drops unknown subscription ids.
    tokio::task::spawn(async move {
        while let Some(message) = rx.next().await {
            user_ws_tx
                .send(message)
                .unwrap_or_else(|err| {
                    log::debug!("Failed websocket send: {}", err);
                })
                .await;
        }
    });

    // Register the session and enqueue its snapshot in one critical section,
    // so no broadcast can slot in before the snapshot.
    {
        let info = server_info(&state).await;
        let channels = state.channels.read().await;
        let services = state.services.read().await;
        let mut clients = state.clients.write().await;
        let mut snapshot = vec![
            info,
            ServerMessage::Advertise {
                channels: channels.values().cloned().collect(),
            },
        ];
        if state.capabilities.contains(&Capability::Services) {
            snapshot.push(ServerMessage::AdvertiseServices {
                services: services.values().cloned().collect(),
            });
        }
        for message in &snapshot {
            match serde_json::to_string(message) {
                // The queue is freshly created and cannot be full here.
                Ok(text) => {
                    let _ = tx.try_send(Message::text(text));
                }
                Err(err) => log::error!("Failed to encode snapshot message: {}", err),
            }
        }
        clients.insert(
            client_id,
            Client {
                id: client_id,
                tx: tx.clone(),
                state: ClientState::default(),
            },
        );
    }

    let server = FoxgloveServer {
        state: state.clone(),
    };
    let mut shutdown_rx = state.shutdown.subscribe();
    if !*shutdown_rx.borrow() {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                next = user_ws_rx.next() => {
                    let Some(result) = next else { break };
                    let ws_msg = match result {
                        Ok(msg) => msg,
                        Err(err) => {
                            log::info!("Failed receiving from {}: {}", peer, err);
                            break;
                        }
                    };
                    if ws_msg.is_close() {
                        break;
                    }
                    if let Err(err) =
                        handle_raw_client_message(&server, client_id, &peer, &tx, ws_msg).await
                    {
                        log::error!("Error in session with {}: {:#}", peer, err);
                        let _ = tx.send(Message::close_with(1011u16, "internal error")).await;
                        break;
                    }
                }
            }
        }
    }
    let _ = tx.send(Message::close()).await;

    // Evaluate unsubscribe edges for whatever the session still held. The
    // parameter union shrinks the same way.
    let (unsubscribed_channels, dropped_params) = {
        let mut clients = state.clients.write().await;
        match clients.remove(&client_id) {
            None => (Vec::new(), Vec::new()),
            Some(client) => {
                let unsubscribed: Vec<ChannelId> = client
                    .state
                    .subscribed_channels()
                    .filter(|chan_id| !any_subscribed(&clients, *chan_id))
                    .collect();
                let dropped: Vec<String> = client
                    .state
                    .subscribed_params()
                    .iter()
                    .filter(|name| !any_param_subscriber(&clients, name))
                    .cloned()
                    .collect();
                (unsubscribed, dropped)
            }
        }
    };
    let listener = state.listener.read().await.clone();
    if let Some(listener) = listener {
        for chan_id in unsubscribed_channels {
            listener.on_unsubscribe(&server, chan_id).await;
        }
        if !dropped_params.is_empty() {
            listener
                .on_parameters_subscribe(&server, dropped_params, false)
                .await;
        }
    }
    log::info!("Connection to {} closed", peer);
}

async fn handle_raw_client_message(
    server: &FoxgloveServer,
    client_id: Uuid,
    peer: &str,
    tx: &mpsc::Sender<Message>,
    ws_msg: Message,
) -> anyhow::Result<()> {
    let outcome = if ws_msg.is_text() {
        match ws_msg.to_str() {
            Ok(text) => handle_client_text_message(server, client_id, peer, tx, text).await,
            Err(()) => Err(anyhow!("Received text frame with invalid UTF-8")),
        }
    } else if ws_msg.is_binary() {
        handle_client_binary_message(server, client_id, peer, tx, ws_msg.as_bytes()).await
    } else {
        // Pings and pongs are answered by the transport; close frames end the
        // session loop.
        Ok(())
    };
    if let Err(err) = outcome {
        log::warn!("Error handling message from {}: {:#}", peer, err);
        enqueue_status(tx, StatusLevel::Error, format!("{:#}", err), None).await?;
    }
    Ok(())
}

async fn handle_client_text_message(
    server: &FoxgloveServer,
    client_id: Uuid,
    peer: &str,
    tx: &mpsc::Sender<Message>,
    text: &str,
) -> anyhow::Result<()> {
    let message: ClientMessage =
        serde_json::from_str(text).context("Error parsing client message")?;
    log::debug!("Got message from {}: {:?}", peer, message);
    let state = &server.state;
    let listener = state.listener.read().await.clone();

    enum SubscribeOutcome {
        Rejected(StatusLevel, String),
        Accepted { first: bool },
    }

    match message {
        ClientMessage::Subscribe { subscriptions } => {
            for sub in subscriptions {
                let outcome = {
                    let channels = state.channels.read().await;
                    let mut clients = state.clients.write().await;
                    let already_used = clients
                        .get(&client_id)
                        .map_or(false, |client| client.state.has_subscription_id(sub.id));
                    if already_used {
                        SubscribeOutcome::Rejected(
                            StatusLevel::Error,
                            format!(
                                "Client subscription id {} was already used; ignoring subscription",
                                sub.id
                            ),
                        )
                    } else if !channels.contains_key(&sub.channel_id) {
                        SubscribeOutcome::Rejected(
                            StatusLevel::Warning,
                            format!(
                                "Channel {} is not available; ignoring subscription",
                                sub.channel_id
                            ),
                        )
                    } else {
                        let first = !any_subscribed(&clients, sub.channel_id);
                        let client = clients
                            .get_mut(&client_id)
                            .ok_or_else(|| anyhow!("Client {} gone from client map", client_id))?;
                        if client.state.add_subscription(sub.id, sub.channel_id) {
                            SubscribeOutcome::Accepted { first }
                        } else {
                            SubscribeOutcome::Rejected(
                                StatusLevel::Warning,
                                format!(
                                    "Client is already subscribed to channel {}; ignoring subscription",
                                    sub.channel_id
                                ),
                            )
                        }
                    }
                };
                match outcome {
                    SubscribeOutcome::Rejected(level, message) => {
                        enqueue_status(tx, level, message, None).await?;
                    }
                    SubscribeOutcome::Accepted { first } => {
                        log::debug!(
                            "Client {} subscribed to channel {} with its own {}",
                            peer,
                            sub.channel_id,
                            sub.id
                        );
                        if first {
                            if let Some(listener) = &listener {
                                listener.on_subscribe(server, sub.channel_id).await;
                            }
                        }
                    }
                }
            }
        }
        ClientMessage::Unsubscribe { subscription_ids } => {
            for sub_id in subscription_ids {
                let removed = {
                    let mut clients = state.clients.write().await;
                    let chan_id = {
                        let client = clients
                            .get_mut(&client_id)
                            .ok_or_else(|| anyhow!("Client {} gone from client map", client_id))?;
                        client.state.remove_subscription(sub_id)
                    };
                    chan_id.map(|chan_id| (chan_id, !any_subscribed(&clients, chan_id)))
                };
                match removed {
                    None => {
                        enqueue_status(
                            tx,
                            StatusLevel::Warning,
                            format!(
                                "Client subscription id {} did not exist; ignoring unsubscription",
                                sub_id
                            ),
                            None,
                        )
                        .await?;
                    }
                    Some((chan_id, last)) => {
                        log::debug!("Client {} unsubscribed from channel {}", peer, chan_id);
                        if last {
                            if let Some(listener) = &listener {
                                listener.on_unsubscribe(server, chan_id).await;
                            }
                        }
                    }
                }
            }
        }
        ClientMessage::Advertise { channels } => {
            for channel in channels {
                let channel_id = channel.id;
                let added = {
                    let mut clients = state.clients.write().await;
                    let client = clients
                        .get_mut(&client_id)
                        .ok_or_else(|| anyhow!("Client {} gone from client map", client_id))?;
                    client.state.add_client_channel(channel.clone())
                };
                if added {
                    log::debug!(
                        "Client {} advertised channel {} ({})",
                        peer,
                        channel_id,
                        channel.topic
                    );
                    if let Some(listener) = &listener {
                        listener.on_client_advertise(server, &channel).await;
                    }
                } else {
                    enqueue_status(
                        tx,
                        StatusLevel::Warning,
                        format!("Failed to add client channel {}", channel_id),
                        None,
                    )
                    .await?;
                }
            }
        }
        ClientMessage::Unadvertise { channel_ids } => {
            for channel_id in channel_ids {
                let removed = {
                    let mut clients = state.clients.write().await;
                    let client = clients
                        .get_mut(&client_id)
                        .ok_or_else(|| anyhow!("Client {} gone from client map", client_id))?;
                    client.state.remove_client_channel(channel_id)
                };
                if removed {
                    log::debug!("Client {} unadvertised channel {}", peer, channel_id);
                    if let Some(listener) = &listener {
                        listener.on_client_unadvertise(server, channel_id).await;
                    }
                } else {
                    enqueue_status(
                        tx,
                        StatusLevel::Warning,
                        format!("Failed to remove client channel {}", channel_id),
                        None,
                    )
                    .await?;
                }
            }
        }
        ClientMessage::GetParameters {
            parameter_names,
            id,
        } => {
            if let Some(listener) = &listener {
                let parameters = listener
                    .on_get_parameters(server, parameter_names, id.as_deref())
                    .await;
                enqueue_json(tx, &ServerMessage::ParameterValues { parameters, id }).await?;
            }
        }
        ClientMessage::SetParameters { parameters, id } => {
            if let Some(listener) = &listener {
                let updated = listener
                    .on_set_parameters(server, parameters, id.as_deref())
                    .await;
                if id.is_some() {
                    enqueue_json(
                        tx,
                        &ServerMessage::ParameterValues {
                            parameters: updated.clone(),
                            id,
                        },
                    )
                    .await?;
                }
                server.update_parameters(updated).await?;
            }
        }
        ClientMessage::SubscribeParameterUpdates { parameter_names } => {
            let crossing = {
                let mut clients = state.clients.write().await;
                let mut crossing: Vec<String> = Vec::new();
                for name in &parameter_names {
                    if !crossing.contains(name) && !any_param_subscriber(&clients, name) {
                        crossing.push(name.clone());
                    }
                }
                let client = clients
                    .get_mut(&client_id)
                    .ok_or_else(|| anyhow!("Client {} gone from client map", client_id))?;
                client.state.subscribe_params(parameter_names);
                crossing
            };
            if !crossing.is_empty() {
                if let Some(listener) = &listener {
                    listener.on_parameters_subscribe(server, crossing, true).await;
                }
            }
        }
        ClientMessage::UnsubscribeParameterUpdates { parameter_names } => {
            let crossing = {
                let mut clients = state.clients.write().await;
                let mut was_subscribed: Vec<String> = Vec::new();
                for name in &parameter_names {
                    if !was_subscribed.contains(name) && any_param_subscriber(&clients, name) {
                        was_subscribed.push(name.clone());
                    }
                }
                {
                    let client = clients
                        .get_mut(&client_id)
                        .ok_or_else(|| anyhow!("Client {} gone from client map", client_id))?;
                    client.state.unsubscribe_params(&parameter_names);
                }
                was_subscribed
                    .into_iter()
                    .filter(|name| !any_param_subscriber(&clients, name))
                    .collect::<Vec<String>>()
            };
            if !crossing.is_empty() {
                if let Some(listener) = &listener {
                    listener
                        .on_parameters_subscribe(server, crossing, false)
                        .await;
                }
            }
        }
    }
    Ok(())
}

async fn handle_client_binary_message(
    server: &FoxgloveServer,
    client_id: Uuid,
    peer: &str,
    tx: &mpsc::Sender<Message>,
    data: &[u8],
) -> anyhow::Result<()> {
    let state = &server.state;
    match framing::decode_client_frame(data)? {
        ClientFrame::MessageData {
            channel_id,
            payload,
        } => {
            let advertised = state
                .clients
                .read()
                .await
                .get(&client_id)
                .map_or(false, |client| client.state.has_client_channel(channel_id));
            if !advertised {
                bail!("Channel {} not registered by client {}", channel_id, peer);
            }
            let listener = state.listener.read().await.clone();
            if let Some(listener) = listener {
                listener.on_client_message(server, channel_id, payload).await;
            }
        }
        ClientFrame::ServiceCallRequest {
            service_id,
            call_id,
            encoding,
            payload,
        } => {
            if !state.services.read().await.contains_key(&service_id) {
                bail!("Unknown service {}", service_id);
            }
            let listener = state.listener.read().await.clone();
            if let Some(listener) = listener {
                let response = listener
                    .on_service_request(server, service_id, call_id, encoding, payload)
                    .await?;
                let frame = framing::service_call_response(service_id, call_id, encoding, &response)?;
                if tx.send(Message::binary(frame)).await.is_err() {
                    log::debug!("Client {} is gone; dropping service response", peer);
                }
            }
        }
    }
    Ok(())
}
