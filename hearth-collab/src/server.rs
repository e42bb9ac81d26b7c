//! WebSocket gateway exposing a [`LocalStore`] to remote clients.
//!
//! Architecture:
//! ```text
//! RemoteStore A ──┐                              ┌── forwarder (sub 3) ──► A
//!                 ├── connection task ── LocalStore.as_user(uid)
//! RemoteStore B ──┘   (one per socket)           └── forwarder (sub 9) ──► B
//!                                   │
//!                                   └── StorageBackend (memory / RocksDB)
//! ```
//!
//! Each connection starts signed out. Its Hello frame carries a token that
//! the gateway's [`TokenVerifier`] resolves to a uid; access rules evaluate
//! every later request against that uid. A token that does not verify
//! leaves the connection signed out. Requests are executed in arrival
//! order. Live queries are forwarded by one task per subscription until the
//! client unsubscribes, the subscription fails or the socket closes.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{StaticTokenVerifier, TokenVerifier, TrustedNetworkVerifier};
use crate::bus::PermissionErrorBus;
use crate::error::CollabError;
use crate::protocol::{FrameType, Hello, StoreFrame, StoreRequest, StoreResponse};
use crate::store::{DocumentStore, LocalStore, MemoryBackend, StorageBackend, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Live queries a single connection may hold open
    pub max_subscriptions_per_connection: usize,
    /// Accepted Hello tokens, token to uid
    pub tokens: BTreeMap<String, String>,
    /// Take the Hello token as the uid itself. Trusted networks only.
    pub trust_client_uid: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_subscriptions_per_connection: 64,
            tokens: BTreeMap::new(),
            trust_client_uid: false,
        }
    }
}

impl GatewayConfig {
    /// Ephemeral port on localhost.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_subscriptions_per_connection: 16,
            ..Self::default()
        }
    }

    /// Verifier described by this config.
    pub fn verifier(&self) -> Arc<dyn TokenVerifier> {
        if self.trust_client_uid {
            log::warn!("Gateway accepts client-claimed uids without verification");
            Arc::new(TrustedNetworkVerifier)
        } else {
            Arc::new(
                self.tokens
                    .iter()
                    .map(|(token, uid)| (token.as_str(), uid.as_str()))
                    .collect::<StaticTokenVerifier>(),
            )
        }
    }
}

/// Gateway statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub total_bytes: u64,
    pub active_subscriptions: u64,
    pub denied_requests: u64,
    pub rejected_hellos: u64,
}

/// The store gateway.
pub struct StoreGateway<B: StorageBackend = MemoryBackend> {
    config: GatewayConfig,
    store: LocalStore<B>,
    stats: Arc<RwLock<GatewayStats>>,
    bus: Option<PermissionErrorBus>,
    verifier: Arc<dyn TokenVerifier>,
}

impl<B: StorageBackend> StoreGateway<B> {
    pub fn new(config: GatewayConfig, store: LocalStore<B>) -> Self {
        let verifier = config.verifier();
        Self {
            config,
            store: store.signed_out(),
            stats: Arc::new(RwLock::new(GatewayStats::default())),
            bus: None,
            verifier,
        }
    }

    /// Verify Hello tokens with `verifier` instead of the configured table.
    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Publish every rejected request on `bus`.
    pub fn with_bus(mut self, bus: PermissionErrorBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Store gateway listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let store = self.store.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let bus = self.bus.clone();
            let verifier = self.verifier.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, store, stats, config, bus, verifier).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> GatewayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn store(&self) -> &LocalStore<B> {
        &self.store
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection<B: StorageBackend>(
    stream: TcpStream,
    addr: SocketAddr,
    root: LocalStore<B>,
    stats: Arc<RwLock<GatewayStats>>,
    config: GatewayConfig,
    bus: Option<PermissionErrorBus>,
    verifier: Arc<dyn TokenVerifier>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    // Frames produced by subscription forwarders
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<StoreFrame>();
    // Ids of forwarders whose subscription ended on its own
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<u64>();
    let mut store = root.signed_out();
    let mut subscriptions: HashMap<u64, JoinHandle<()>> = HashMap::new();

    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_bytes += data.len() as u64;
                            }
                            let frame = match StoreFrame::decode(&data) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            match frame.msg_type {
                                FrameType::Hello => {
                                    let verified = match frame.body::<Hello>() {
                                        Ok(hello) => authenticate(verifier.as_ref(), hello.token.as_deref()).await,
                                        Err(e) => Err(StoreError::InvalidArgument(e.to_string())),
                                    };
                                    let response = match verified {
                                        Ok(uid) => {
                                            log::info!(
                                                "Connection {addr} bound to {}",
                                                uid.as_deref().unwrap_or("<signed out>")
                                            );
                                            store = match &uid {
                                                Some(uid) => root.as_user(uid.as_str()),
                                                None => root.signed_out(),
                                            };
                                            StoreResponse::SignedIn { uid }
                                        }
                                        Err(error) => {
                                            log::warn!("Rejected hello from {addr}: {error}");
                                            stats.write().await.rejected_hellos += 1;
                                            store = root.signed_out();
                                            StoreResponse::Failed { error }
                                        }
                                    };
                                    let encoded = StoreFrame::response(frame.request_id, &response)?.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }

                                FrameType::Request => {
                                    let request = frame.body::<StoreRequest>();
                                    let data = request.as_ref().ok().and_then(request_data);
                                    let response = match request {
                                        Ok(StoreRequest::Subscribe { query }) => {
                                            if subscriptions.contains_key(&frame.request_id) {
                                                StoreResponse::Failed {
                                                    error: StoreError::InvalidArgument(format!(
                                                        "subscription {} already open",
                                                        frame.request_id
                                                    )),
                                                }
                                            } else if subscriptions.len() >= config.max_subscriptions_per_connection {
                                                StoreResponse::Failed {
                                                    error: StoreError::InvalidArgument(format!(
                                                        "subscription limit ({}) reached",
                                                        config.max_subscriptions_per_connection
                                                    )),
                                                }
                                            } else {
                                                match store.subscribe(query).await {
                                                    Ok(sub) => {
                                                        let forwarder = spawn_forwarder(
                                                            frame.request_id,
                                                            sub,
                                                            out_tx.clone(),
                                                            ended_tx.clone(),
                                                        );
                                                        subscriptions.insert(frame.request_id, forwarder);
                                                        stats.write().await.active_subscriptions += 1;
                                                        StoreResponse::Subscribed
                                                    }
                                                    Err(error) => StoreResponse::Failed { error },
                                                }
                                            }
                                        }
                                        Ok(request) => {
                                            log::trace!("{addr}: {} request {}", request.name(), frame.request_id);
                                            execute(&store, request).await
                                        }
                                        Err(e) => StoreResponse::Failed {
                                            error: StoreError::InvalidArgument(e.to_string()),
                                        },
                                    };

                                    {
                                        let mut s = stats.write().await;
                                        s.total_requests += 1;
                                        if let StoreResponse::Failed { error } = &response {
                                            if error.is_permission_denied() {
                                                s.denied_requests += 1;
                                                if let Some(bus) = &bus {
                                                    bus.capture(error.clone(), data);
                                                }
                                            }
                                        }
                                    }

                                    let encoded = StoreFrame::response(frame.request_id, &response)?.encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }

                                FrameType::Unsubscribe => {
                                    if let Some(forwarder) = subscriptions.remove(&frame.request_id) {
                                        forwarder.abort();
                                        let mut s = stats.write().await;
                                        s.active_subscriptions = s.active_subscriptions.saturating_sub(1);
                                    }
                                }

                                FrameType::Ping => {
                                    let encoded = StoreFrame::pong().encode()?;
                                    ws_sender.send(Message::Binary(encoded.into())).await?;
                                }

                                other => {
                                    log::debug!("Unhandled frame type from {addr}: {other:?}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                Some(frame) = out_rx.recv() => {
                    let encoded = frame.encode()?;
                    ws_sender.send(Message::Binary(encoded.into())).await?;
                }

                Some(subscription_id) = ended_rx.recv() => {
                    if subscriptions.remove(&subscription_id).is_some() {
                        let mut s = stats.write().await;
                        s.active_subscriptions = s.active_subscriptions.saturating_sub(1);
                        log::debug!("{addr}: subscription {subscription_id} ended");
                    }
                }
            }
        }
        Ok::<(), BoxError>(())
    }
    .await;

    let released = subscriptions.len() as u64;
    for (_, forwarder) in subscriptions.drain() {
        forwarder.abort();
    }
    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_subscriptions = s.active_subscriptions.saturating_sub(released);
    }

    result
}

/// Resolve a Hello token. No token means a signed-out connection.
async fn authenticate(verifier: &dyn TokenVerifier, token: Option<&str>) -> Result<Option<String>, StoreError> {
    let Some(token) = token else {
        return Ok(None);
    };
    match verifier.verify(token).await {
        Ok(uid) => Ok(Some(uid)),
        Err(CollabError::AuthFailed(reason)) => Err(StoreError::Unauthenticated(reason)),
        Err(other) => Err(StoreError::Unauthenticated(other.to_string())),
    }
}

/// Run one non-subscribe request against the connection's store handle.
async fn execute<B: StorageBackend>(store: &LocalStore<B>, request: StoreRequest) -> StoreResponse {
    let result = match request {
        StoreRequest::Add { collection, data } => store
            .add(&collection, data)
            .await
            .map(|id| StoreResponse::Added { id }),
        StoreRequest::Set { path, data } => store.set(&path, data).await.map(|_| StoreResponse::Done),
        StoreRequest::Get { path } => store
            .get(&path)
            .await
            .map(|doc| StoreResponse::Document { doc }),
        StoreRequest::Update { path, patch } => store
            .update(&path, patch)
            .await
            .map(|_| StoreResponse::Done),
        StoreRequest::Delete { path } => store.delete(&path).await.map(|_| StoreResponse::Done),
        StoreRequest::Query { query } => store
            .query(&query)
            .await
            .map(|docs| StoreResponse::Documents { docs }),
        StoreRequest::Subscribe { .. } => Err(StoreError::InvalidArgument(
            "subscribe is handled by the connection".into(),
        )),
    };
    result.unwrap_or_else(|error| StoreResponse::Failed { error })
}

/// Document body carried by a write, attached to permission reports.
fn request_data(request: &StoreRequest) -> Option<serde_json::Value> {
    match request {
        StoreRequest::Add { data, .. } | StoreRequest::Set { data, .. } => Some(data.to_json()),
        StoreRequest::Update { patch, .. } => Some(patch.to_json()),
        _ => None,
    }
}

/// Forward a live query to the connection as Snapshot frames. When the
/// subscription ends on its own the id is reported on `ended`.
fn spawn_forwarder(
    subscription_id: u64,
    mut sub: crate::store::Subscription,
    out: mpsc::UnboundedSender<StoreFrame>,
    ended: mpsc::UnboundedSender<u64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        forward(subscription_id, &mut sub, &out).await;
        let _ = ended.send(subscription_id);
    })
}

async fn forward(
    subscription_id: u64,
    sub: &mut crate::store::Subscription,
    out: &mpsc::UnboundedSender<StoreFrame>,
) {
    while let Some(item) = sub.next().await {
        let frame = match &item {
            Ok(snapshot) => StoreFrame::snapshot(subscription_id, snapshot),
            Err(error) => StoreFrame::subscription_error(subscription_id, error),
        };
        match frame {
            Ok(frame) => {
                if out.send(frame).is_err() {
                    return;
                }
            }
            Err(e) => log::error!("Failed to encode snapshot for subscription {subscription_id}: {e}"),
        }
        if item.is_err() {
            return;
        }
    }
}
