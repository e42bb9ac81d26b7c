//! Collaboration-layer errors.

use crate::store::{Operation, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request rejected by access control, with enough context to show the
/// user what was attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("missing or insufficient permissions: {operation} on {path}")]
pub struct PermissionError {
    pub path: String,
    pub operation: Operation,
    /// Payload of the rejected create/update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_resource_data: Option<Value>,
}

impl PermissionError {
    pub fn new(path: impl Into<String>, operation: Operation) -> Self {
        Self {
            path: path.into(),
            operation,
            request_resource_data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.request_resource_data = Some(data);
        self
    }

    /// Multi-line rendering for the application shell.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "Operation: {}\nPath: {}",
            self.operation.as_str().to_uppercase(),
            self.path
        );
        if let Some(data) = &self.request_resource_data {
            let pretty = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
            out.push_str("\nData: ");
            out.push_str(&pretty);
        }
        out
    }
}

/// Errors returned by the registry, sync engine and capabilities.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollabError {
    #[error(transparent)]
    PermissionDenied(PermissionError),
    /// Rejected before any write
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Transport or storage failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl CollabError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CollabError::Validation(msg.into())
    }

    pub fn permission(&self) -> Option<&PermissionError> {
        match self {
            CollabError::PermissionDenied(e) => Some(e),
            _ => None,
        }
    }
}

impl CollabError {
    /// Convert a store error, attaching the rejected payload to denials.
    pub fn from_store(err: StoreError, data: Option<Value>) -> Self {
        match err {
            StoreError::PermissionDenied { path, operation } => {
                CollabError::PermissionDenied(PermissionError {
                    path,
                    operation,
                    request_resource_data: data,
                })
            }
            StoreError::Unauthenticated(reason) => CollabError::AuthFailed(reason),
            other => CollabError::Io(other.to_string()),
        }
    }
}

impl From<StoreError> for CollabError {
    fn from(err: StoreError) -> Self {
        CollabError::from_store(err, None)
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;
