//! Binary protocol between [`RemoteStore`](crate::client::RemoteStore) and
//! [`StoreGateway`](crate::server::StoreGateway).
//!
//! Wire format (bincode-encoded, one frame per WebSocket binary message):
//! ```text
//! ┌──────────┬────────────┬─────────────────────┐
//! │ msg_type │ request_id │ payload             │
//! │ 1 byte   │ varint u64 │ JSON body, variable │
//! └──────────┴────────────┴─────────────────────┘
//! ```
//!
//! Bodies are JSON because document fields are schemaless
//! (`serde_json::Value`), which bincode cannot decode. For `Snapshot`,
//! `SubscriptionError` and `Unsubscribe` the `request_id` is the id of the
//! `subscribe` request that opened the subscription.
//!
//! A connection authenticates with its Hello frame. The gateway resolves the
//! token to a uid and answers with a Response on the Hello's `request_id`:
//! `SignedIn` on success, `Failed` with `Unauthenticated` otherwise.

use crate::store::{CollectionPath, DocPath, Query, Snapshot, StoreError, StoredDoc, WriteData};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Client → server, first frame: presents the connection's credentials
    Hello = 1,
    /// Client → server store operation
    Request = 2,
    /// Server → client result of a Request
    Response = 3,
    /// Server → client, full result set of a live query
    Snapshot = 4,
    /// Server → client, terminal subscription failure
    SubscriptionError = 5,
    /// Client → server, release a subscription
    Unsubscribe = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Body of a Hello frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Bearer token, None for a signed-out connection
    pub token: Option<String>,
}

/// Store operation carried by a Request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum StoreRequest {
    Add {
        collection: CollectionPath,
        data: WriteData,
    },
    Set {
        path: DocPath,
        data: WriteData,
    },
    Get {
        path: DocPath,
    },
    Update {
        path: DocPath,
        patch: WriteData,
    },
    Delete {
        path: DocPath,
    },
    Query {
        query: Query,
    },
    Subscribe {
        query: Query,
    },
}

impl StoreRequest {
    pub fn name(&self) -> &'static str {
        match self {
            StoreRequest::Add { .. } => "add",
            StoreRequest::Set { .. } => "set",
            StoreRequest::Get { .. } => "get",
            StoreRequest::Update { .. } => "update",
            StoreRequest::Delete { .. } => "delete",
            StoreRequest::Query { .. } => "query",
            StoreRequest::Subscribe { .. } => "subscribe",
        }
    }
}

/// Result carried by a Response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum StoreResponse {
    Added { id: String },
    Done,
    Document { doc: Option<StoredDoc> },
    Documents { docs: Vec<StoredDoc> },
    Subscribed,
    /// Answer to Hello: the uid the connection acts as
    SignedIn { uid: Option<String> },
    Failed { error: StoreError },
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreFrame {
    pub msg_type: FrameType,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

impl StoreFrame {
    fn with_body<T: Serialize>(msg_type: FrameType, request_id: u64, body: &T) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type,
            request_id,
            payload,
        })
    }

    fn empty(msg_type: FrameType, request_id: u64) -> Self {
        Self {
            msg_type,
            request_id,
            payload: Vec::new(),
        }
    }

    pub fn hello(request_id: u64, token: Option<&str>) -> Result<Self, ProtocolError> {
        Self::with_body(
            FrameType::Hello,
            request_id,
            &Hello {
                token: token.map(str::to_string),
            },
        )
    }

    pub fn request(request_id: u64, request: &StoreRequest) -> Result<Self, ProtocolError> {
        Self::with_body(FrameType::Request, request_id, request)
    }

    pub fn response(request_id: u64, response: &StoreResponse) -> Result<Self, ProtocolError> {
        Self::with_body(FrameType::Response, request_id, response)
    }

    pub fn snapshot(subscription_id: u64, snapshot: &Snapshot) -> Result<Self, ProtocolError> {
        Self::with_body(FrameType::Snapshot, subscription_id, snapshot)
    }

    pub fn subscription_error(subscription_id: u64, error: &StoreError) -> Result<Self, ProtocolError> {
        Self::with_body(FrameType::SubscriptionError, subscription_id, error)
    }

    pub fn unsubscribe(subscription_id: u64) -> Self {
        Self::empty(FrameType::Unsubscribe, subscription_id)
    }

    pub fn ping() -> Self {
        Self::empty(FrameType::Ping, 0)
    }

    pub fn pong() -> Self {
        Self::empty(FrameType::Pong, 0)
    }

    /// Decode the JSON body.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Decode the body of a frame that must be of type `expected`.
    pub fn expect_body<T: DeserializeOwned>(&self, expected: FrameType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        self.body()
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

impl From<ProtocolError> for StoreError {
    fn from(e: ProtocolError) -> Self {
        StoreError::Transport(e.to_string())
    }
}
