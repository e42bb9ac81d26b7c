//! Document store capability.
//!
//! The collaboration layer is a client of a path-addressed document
//! database with per-query live subscriptions and server-side access
//! rules. This module defines that contract; the implementations are:
//!
//! ```text
//!                 ┌──────────────────────────┐
//!                 │  dyn DocumentStore       │
//!                 └────────────┬─────────────┘
//!          ┌───────────────────┼────────────────────┐
//!          ▼                   ▼                    ▼
//! LocalStore<Memory>   LocalStore<Rocks>      RemoteStore
//!   (in process)        (RocksDB, LZ4)     (WebSocket → StoreGateway)
//! ```
//!
//! Every operation may fail with [`StoreError::PermissionDenied`], which is
//! always distinguishable from a missing document or a transport failure.

pub mod backend;
pub mod local;
pub mod path;
pub mod rocks;
pub mod rules;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;

pub use backend::{MemoryBackend, StorageBackend};
pub use local::LocalStore;
pub use path::{CollectionPath, DocPath};
pub use rocks::{RocksBackend, StoreConfig};
pub use rules::{AccessPolicy, AccessRequest, AllowAll, ReadingRoomRules};

/// Field map of a stored document.
pub type Fields = Map<String, Value>;

/// Pseudo-field that filters on the document id.
pub const FIELD_ID: &str = "__name__";

/// Maximum number of values accepted by an `in` filter.
pub const MAX_IN_VALUES: usize = 30;

/// Operation kinds evaluated by access rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::List => "list",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    /// Rejected by access rules
    #[error("missing or insufficient permissions: {operation} on {path}")]
    PermissionDenied { path: String, operation: Operation },
    /// Target document does not exist (update only)
    #[error("document not found: {0}")]
    NotFound(String),
    /// Malformed path, filter or value
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Backend failure
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    /// Connection to a remote store failed or was lost
    #[error("transport error: {0}")]
    Transport(String),
    /// A gateway refused the connection's credentials
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
}

impl StoreError {
    pub fn denied(path: impl Into<String>, operation: Operation) -> Self {
        StoreError::PermissionDenied {
            path: path.into(),
            operation,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StoreError::PermissionDenied { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// A document as returned by reads, queries and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDoc {
    pub id: String,
    pub data: Fields,
}

impl StoredDoc {
    pub fn new(id: impl Into<String>, data: Fields) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Decode into a typed record, injecting the document id as `id`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let mut data = self.data.clone();
        data.insert("id".to_string(), Value::String(self.id.clone()));
        Ok(serde_json::from_value(Value::Object(data))?)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        if field == FIELD_ID {
            return None;
        }
        self.data.get(field)
    }
}

/// Value written to a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldValue {
    Value(Value),
    /// Replaced by the store's clock (epoch millis) when the write lands
    ServerTimestamp,
    /// Append each value not already present
    ArrayUnion(Vec<Value>),
    /// Remove every occurrence of each value
    ArrayRemove(Vec<Value>),
}

/// Field writes for a create or a merge update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteData(BTreeMap<String, FieldValue>);

impl WriteData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain field writes taken from a serializable record.
    pub fn from_record<T: Serialize>(record: &T) -> Result<Self, StoreError> {
        match serde_json::to_value(record)? {
            Value::Object(map) => Ok(Self(
                map.into_iter()
                    .map(|(k, v)| (k, FieldValue::Value(v)))
                    .collect(),
            )),
            other => Err(StoreError::Serialization(format!(
                "expected an object, got {other}"
            ))),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), FieldValue::Value(value.into()));
        self
    }

    pub fn server_timestamp(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), FieldValue::ServerTimestamp);
        self
    }

    pub fn array_union(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.0.insert(field.into(), FieldValue::ArrayUnion(values));
        self
    }

    pub fn array_remove(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.0.insert(field.into(), FieldValue::ArrayRemove(values));
        self
    }

    /// Drop a field from the write.
    pub fn without(mut self, field: &str) -> Self {
        self.0.remove(field);
        self
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Apply the writes on top of `base` (None for a create).
    pub fn resolve(&self, base: Option<&Fields>, now_millis: i64) -> Fields {
        let mut out = base.cloned().unwrap_or_default();
        for (field, write) in &self.0 {
            let resolved = match write {
                FieldValue::Value(v) => v.clone(),
                FieldValue::ServerTimestamp => Value::from(now_millis),
                FieldValue::ArrayUnion(values) => {
                    let mut items = existing_array(&out, field);
                    for v in values {
                        if !items.contains(v) {
                            items.push(v.clone());
                        }
                    }
                    Value::Array(items)
                }
                FieldValue::ArrayRemove(values) => {
                    let mut items = existing_array(&out, field);
                    items.retain(|item| !values.contains(item));
                    Value::Array(items)
                }
            };
            out.insert(field.clone(), resolved);
        }
        out
    }

    /// Readable JSON rendering used in permission diagnostics.
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|(field, write)| {
                let v = match write {
                    FieldValue::Value(v) => v.clone(),
                    FieldValue::ServerTimestamp => json!("serverTimestamp()"),
                    FieldValue::ArrayUnion(values) => json!({ "arrayUnion": values }),
                    FieldValue::ArrayRemove(values) => json!({ "arrayRemove": values }),
                };
                (field.clone(), v)
            })
            .collect();
        Value::Object(map)
    }
}

fn existing_array(fields: &Fields, field: &str) -> Vec<Value> {
    match fields.get(field) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

/// Comparison used by a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    Eq,
    /// Field equals one of the values in an array
    In,
    /// Array field contains the value
    ArrayContains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, doc: &StoredDoc) -> bool {
        let actual = if self.field == FIELD_ID {
            Some(Value::String(doc.id.clone()))
        } else {
            doc.data.get(&self.field).cloned()
        };

        match self.op {
            FilterOp::Eq => actual.as_ref() == Some(&self.value),
            FilterOp::In => match (&actual, self.value.as_array()) {
                (Some(a), Some(candidates)) => candidates.contains(a),
                _ => false,
            },
            FilterOp::ArrayContains => actual
                .as_ref()
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(&self.value)),
        }
    }
}

/// Documents of one collection matching every filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: CollectionPath,
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn collection(collection: CollectionPath) -> Self {
        Self {
            collection,
            filters: Vec::new(),
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        });
        self
    }

    pub fn where_in(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op: FilterOp::In,
            value: Value::Array(values),
        });
        self
    }

    pub fn where_array_contains(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op: FilterOp::ArrayContains,
            value: value.into(),
        });
        self
    }

    pub fn matches(&self, doc: &StoredDoc) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Reject filters the store cannot evaluate.
    pub fn validate(&self) -> Result<(), StoreError> {
        for f in &self.filters {
            if f.op == FilterOp::In {
                let len = f.value.as_array().map(Vec::len).ok_or_else(|| {
                    StoreError::InvalidArgument(format!("'in' filter on {} needs an array", f.field))
                })?;
                if len > MAX_IN_VALUES {
                    return Err(StoreError::InvalidArgument(format!(
                        "'in' filter on {} has {len} values (max {MAX_IN_VALUES})",
                        f.field
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Full result set a subscription currently observes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub docs: Vec<StoredDoc>,
}

pub type SnapshotResult = Result<Snapshot, StoreError>;

/// Live subscription handle.
///
/// Yields a full snapshot on every change of the watched collection. An
/// `Err` item is terminal. Dropping the handle releases the subscription.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<SnapshotResult>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<SnapshotResult>,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Next snapshot, or None once the store side has gone away.
    pub async fn next(&mut self) -> Option<SnapshotResult> {
        self.rx.recv().await
    }

    /// Release the subscription. Same as dropping it.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.on_drop.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("released", &self.on_drop.is_none())
            .finish()
    }
}

/// Path-addressed document store with live queries and access rules.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document with a store-generated id; returns the id.
    async fn add(&self, collection: &CollectionPath, data: WriteData) -> Result<String, StoreError>;

    /// Create or overwrite the document at `path`.
    async fn set(&self, path: &DocPath, data: WriteData) -> Result<(), StoreError>;

    /// Read one document; `Ok(None)` when absent.
    async fn get(&self, path: &DocPath) -> Result<Option<StoredDoc>, StoreError>;

    /// Merge `patch` into an existing document.
    async fn update(&self, path: &DocPath, patch: WriteData) -> Result<(), StoreError>;

    /// Delete a document. Deleting an absent document succeeds.
    async fn delete(&self, path: &DocPath) -> Result<(), StoreError>;

    /// One-shot query.
    async fn query(&self, query: &Query) -> Result<Vec<StoredDoc>, StoreError>;

    /// Live query.
    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError>;
}
