//! Slash-separated document and collection paths.
//!
//! ```text
//! rooms                         collection
//! rooms/{roomId}                document
//! rooms/{roomId}/annotations    collection
//! users/{userId}                document
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

pub const ROOMS: &str = "rooms";
pub const USERS: &str = "users";

/// Path of a collection (odd number of segments).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionPath(String);

/// Path of a single document (even number of segments).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocPath(String);

impl CollectionPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(normalize(path.into()))
    }

    /// Path of the document `id` inside this collection.
    pub fn doc(&self, id: &str) -> DocPath {
        DocPath(format!("{}/{}", self.0, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `path` names a direct child document of this collection.
    pub fn contains(&self, path: &str) -> bool {
        path.strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|id| !id.is_empty() && !id.contains('/'))
    }
}

impl DocPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(normalize(path.into()))
    }

    /// Last path segment.
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Collection holding this document.
    pub fn parent(&self) -> CollectionPath {
        match self.0.rsplit_once('/') {
            Some((parent, _)) => CollectionPath(parent.to_string()),
            None => CollectionPath(String::new()),
        }
    }

    /// Sub-collection `name` under this document.
    pub fn collection(&self, name: &str) -> CollectionPath {
        CollectionPath(format!("{}/{}", self.0, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize(path: String) -> String {
    path.trim_matches('/').to_string()
}

/// `rooms`
pub fn rooms() -> CollectionPath {
    CollectionPath::new(ROOMS)
}

/// `rooms/{room_id}`
pub fn room(room_id: &str) -> DocPath {
    rooms().doc(room_id)
}

/// `users`
pub fn users() -> CollectionPath {
    CollectionPath::new(USERS)
}

/// `users/{user_id}`
pub fn user(user_id: &str) -> DocPath {
    users().doc(user_id)
}
