//! WebSocket client for a remote [`StoreGateway`](crate::server::StoreGateway).
//!
//! [`RemoteStore`] implements [`DocumentStore`], so the registry and the
//! sync engine run unchanged against a gateway instead of an in-process
//! store.
//!
//! Two background tasks per connection:
//! - writer: drains the outgoing channel into the socket
//! - reader: routes Response frames to the waiting request and Snapshot
//!   frames to the matching subscription
//!
//! `connect` waits for the gateway to answer the Hello frame, so a token the
//! gateway does not accept fails the connect with
//! `StoreError::Unauthenticated`.
//!
//! When the socket goes away every pending request fails with
//! `StoreError::Transport` and every open subscription receives a terminal
//! error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{FrameType, ProtocolError, StoreFrame, StoreRequest, StoreResponse};
use crate::store::{
    CollectionPath, DocPath, DocumentStore, Query, Snapshot, SnapshotResult, StoreError, StoredDoc,
    Subscription, WriteData,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a request waits for its response
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

type Pending = HashMap<u64, oneshot::Sender<StoreResponse>>;
type Sinks = HashMap<u64, mpsc::UnboundedSender<SnapshotResult>>;

#[derive(Debug)]
struct Shared {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Mutex<Pending>,
    sinks: Mutex<Sinks>,
    next_id: AtomicU64,
    state: RwLock<ConnectionState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn send_frame(&self, frame: &StoreFrame) -> Result<(), ProtocolError> {
        let encoded = frame.encode()?;
        self.outgoing
            .send(Message::Binary(encoded.into()))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn route(&self, frame: StoreFrame) {
        match frame.msg_type {
            FrameType::Response => {
                let waiter = lock(&self.pending).remove(&frame.request_id);
                let Some(waiter) = waiter else {
                    log::debug!("Response for unknown request {}", frame.request_id);
                    return;
                };
                let response = frame.body::<StoreResponse>().unwrap_or_else(|e| StoreResponse::Failed {
                    error: StoreError::Transport(e.to_string()),
                });
                let _ = waiter.send(response);
            }
            FrameType::Snapshot => {
                let item = frame
                    .body::<Snapshot>()
                    .map_err(|e| StoreError::Transport(e.to_string()));
                let terminal = item.is_err();
                self.deliver(frame.request_id, item, terminal);
            }
            FrameType::SubscriptionError => {
                let error = frame
                    .body::<StoreError>()
                    .unwrap_or_else(|e| StoreError::Transport(e.to_string()));
                self.deliver(frame.request_id, Err(error), true);
            }
            FrameType::Pong => log::trace!("pong"),
            other => log::debug!("Unexpected frame from gateway: {other:?}"),
        }
    }

    fn deliver(&self, subscription_id: u64, item: SnapshotResult, terminal: bool) {
        let mut sinks = lock(&self.sinks);
        let delivered = sinks
            .get(&subscription_id)
            .map(|sink| sink.send(item).is_ok())
            .unwrap_or(false);
        if terminal || !delivered {
            sinks.remove(&subscription_id);
        }
    }

    /// Drop a subscription's sink and tell the gateway. Sent even after a
    /// terminal error, since the gateway holds the slot until told.
    fn release(&self, subscription_id: u64) {
        lock(&self.sinks).remove(&subscription_id);
        let _ = self.send_frame(&StoreFrame::unsubscribe(subscription_id));
    }

    /// Fail everything in flight once the socket is gone.
    fn fail_all(&self) {
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        for (_, waiter) in pending {
            let _ = waiter.send(StoreResponse::Failed {
                error: ProtocolError::ConnectionClosed.into(),
            });
        }
        let sinks: Vec<_> = lock(&self.sinks).drain().collect();
        for (_, sink) in sinks {
            let _ = sink.send(Err(ProtocolError::ConnectionClosed.into()));
        }
    }
}

/// Document store backed by a gateway connection.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    shared: Arc<Shared>,
    uid: Option<String>,
    url: String,
    config: ClientConfig,
}

impl RemoteStore {
    /// Connect to `url` and sign in with `token`; `None` stays signed out.
    pub async fn connect(
        url: impl Into<String>,
        token: Option<&str>,
        config: ClientConfig,
    ) -> Result<Self, StoreError> {
        let url = url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| StoreError::Transport(format!("connect to {url}: {e}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let shared = Arc::new(Shared {
            outgoing: out_tx,
            pending: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state: RwLock::new(ConnectionState::Connecting),
        });

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: route incoming frames
        let reader_shared = shared.clone();
        let reader_url = url.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match StoreFrame::decode(&data) {
                        Ok(frame) => reader_shared.route(frame),
                        Err(e) => log::warn!("Failed to decode frame from {reader_url}: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            log::info!("Disconnected from {reader_url}");
            *reader_shared.state.write().await = ConnectionState::Disconnected;
            reader_shared.fail_all();
        });

        let mut store = Self {
            shared,
            uid: None,
            url,
            config,
        };

        // Nothing else is sent until the gateway has answered the Hello
        let hello_id = store.next_id();
        let answer = store
            .exchange(hello_id, StoreFrame::hello(hello_id, token)?, "hello")
            .await;
        match answer {
            Ok(StoreResponse::SignedIn { uid }) => store.uid = uid,
            Ok(other) => {
                store.disconnect();
                return Err(unexpected(other));
            }
            Err(e) => {
                log::warn!("Gateway {} refused the connection: {e}", store.url);
                store.disconnect();
                return Err(e);
            }
        }

        *store.shared.state.write().await = ConnectionState::Connected;
        log::info!(
            "Connected to {} as {}",
            store.url,
            store.uid.as_deref().unwrap_or("<signed out>")
        );
        Ok(store)
    }

    /// Uid the gateway verified for this connection.
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Subscriptions currently receiving snapshots.
    pub fn open_subscriptions(&self) -> usize {
        lock(&self.shared.sinks).len()
    }

    /// Send a heartbeat ping.
    pub fn send_ping(&self) -> Result<(), StoreError> {
        Ok(self.shared.send_frame(&StoreFrame::ping())?)
    }

    /// Close the socket. Pending requests and subscriptions fail.
    pub fn disconnect(&self) {
        let _ = self.shared.outgoing.send(Message::Close(None));
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn round_trip(&self, request_id: u64, request: &StoreRequest) -> Result<StoreResponse, StoreError> {
        let frame = StoreFrame::request(request_id, request)?;
        self.exchange(request_id, frame, request.name()).await
    }

    /// Send `frame` and wait for the Response carrying `request_id`.
    async fn exchange(&self, request_id: u64, frame: StoreFrame, what: &str) -> Result<StoreResponse, StoreError> {
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(request_id, tx);

        if let Err(e) = self.shared.send_frame(&frame) {
            lock(&self.shared.pending).remove(&request_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(StoreResponse::Failed { error })) => Err(error),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                lock(&self.shared.pending).remove(&request_id);
                log::warn!("{what} request {request_id} timed out");
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    async fn call(&self, request: StoreRequest) -> Result<StoreResponse, StoreError> {
        let request_id = self.next_id();
        self.round_trip(request_id, &request).await
    }
}

fn unexpected(response: StoreResponse) -> StoreError {
    StoreError::Transport(format!("unexpected response: {response:?}"))
}

#[async_trait]
impl DocumentStore for RemoteStore {
    async fn add(&self, collection: &CollectionPath, data: WriteData) -> Result<String, StoreError> {
        match self
            .call(StoreRequest::Add {
                collection: collection.clone(),
                data,
            })
            .await?
        {
            StoreResponse::Added { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn set(&self, path: &DocPath, data: WriteData) -> Result<(), StoreError> {
        match self.call(StoreRequest::Set { path: path.clone(), data }).await? {
            StoreResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get(&self, path: &DocPath) -> Result<Option<StoredDoc>, StoreError> {
        match self.call(StoreRequest::Get { path: path.clone() }).await? {
            StoreResponse::Document { doc } => Ok(doc),
            other => Err(unexpected(other)),
        }
    }

    async fn update(&self, path: &DocPath, patch: WriteData) -> Result<(), StoreError> {
        match self
            .call(StoreRequest::Update {
                path: path.clone(),
                patch,
            })
            .await?
        {
            StoreResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        match self.call(StoreRequest::Delete { path: path.clone() }).await? {
            StoreResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredDoc>, StoreError> {
        query.validate()?;
        match self.call(StoreRequest::Query { query: query.clone() }).await? {
            StoreResponse::Documents { docs } => Ok(docs),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        query.validate()?;
        let subscription_id = self.next_id();

        // Registered first so the initial snapshot has somewhere to go
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.sinks).insert(subscription_id, tx);

        match self.round_trip(subscription_id, &StoreRequest::Subscribe { query }).await {
            Ok(StoreResponse::Subscribed) => {}
            Ok(other) => {
                lock(&self.shared.sinks).remove(&subscription_id);
                return Err(unexpected(other));
            }
            Err(e) => {
                lock(&self.shared.sinks).remove(&subscription_id);
                return Err(e);
            }
        }

        let shared = self.shared.clone();
        Ok(Subscription::new(rx, move || shared.release(subscription_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Port 1 is never a gateway
        let err = RemoteStore::connect("ws://127.0.0.1:1", Some("u1"), ClientConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
    }

    #[tokio::test]
    async fn test_fail_all_ends_waiters_and_subscriptions() {
        let (outgoing, _out_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state: RwLock::new(ConnectionState::Connected),
        };
        let (tx, rx) = oneshot::channel();
        lock(&shared.pending).insert(1, tx);
        let (sink, mut snapshots) = mpsc::unbounded_channel();
        lock(&shared.sinks).insert(2, sink);

        shared.fail_all();

        match rx.await.unwrap() {
            StoreResponse::Failed { error } => assert!(matches!(error, StoreError::Transport(_))),
            other => panic!("unexpected {other:?}"),
        }
        assert!(snapshots.recv().await.unwrap().is_err());
        assert!(lock(&shared.sinks).is_empty());
    }

    #[tokio::test]
    async fn test_route_subscription_error_is_terminal() {
        let (outgoing, _out_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state: RwLock::new(ConnectionState::Connected),
        };
        let (sink, mut snapshots) = mpsc::unbounded_channel();
        lock(&shared.sinks).insert(5, sink);

        shared.route(StoreFrame::snapshot(5, &Snapshot::default()).unwrap());
        assert_eq!(snapshots.recv().await.unwrap().unwrap(), Snapshot::default());
        assert_eq!(lock(&shared.sinks).len(), 1);

        let denied = StoreError::denied("rooms/r1/chat", crate::store::Operation::List);
        shared.route(StoreFrame::subscription_error(5, &denied).unwrap());
        assert_eq!(snapshots.recv().await.unwrap(), Err(denied));
        assert!(lock(&shared.sinks).is_empty());
    }

    #[tokio::test]
    async fn test_release_after_terminal_error_unsubscribes() {
        let (outgoing, mut out_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state: RwLock::new(ConnectionState::Connected),
        };
        let (sink, _snapshots) = mpsc::unbounded_channel();
        lock(&shared.sinks).insert(9, sink);
        let denied = StoreError::denied("rooms/r1/messages", crate::store::Operation::List);
        shared.route(StoreFrame::subscription_error(9, &denied).unwrap());
        assert!(lock(&shared.sinks).is_empty());

        shared.release(9);

        let Some(Message::Binary(bytes)) = out_rx.recv().await else {
            panic!("expected an unsubscribe frame");
        };
        let frame = StoreFrame::decode(&bytes).unwrap();
        assert_eq!(frame.msg_type, FrameType::Unsubscribe);
        assert_eq!(frame.request_id, 9);
    }
}
