//! Storage backends behind [`LocalStore`](super::LocalStore).
//!
//! A backend is a flat, synchronous map from full document path to field
//! map. Rules, field transforms and subscriptions live above it.

use super::{CollectionPath, DocPath, Fields, StoreError, StoredDoc};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Synchronous key/value persistence for documents.
pub trait StorageBackend: Send + Sync + 'static {
    fn load(&self, path: &DocPath) -> Result<Option<Fields>, StoreError>;

    fn save(&self, path: &DocPath, fields: &Fields) -> Result<(), StoreError>;

    fn remove(&self, path: &DocPath) -> Result<(), StoreError>;

    /// Direct children of `collection`, ordered by id.
    fn scan(&self, collection: &CollectionPath) -> Result<Vec<StoredDoc>, StoreError>;
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    docs: RwLock<BTreeMap<String, Fields>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents across all collections.
    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Database("memory backend lock poisoned".into())
}

impl StorageBackend for MemoryBackend {
    fn load(&self, path: &DocPath) -> Result<Option<Fields>, StoreError> {
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(docs.get(path.as_str()).cloned())
    }

    fn save(&self, path: &DocPath, fields: &Fields) -> Result<(), StoreError> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        docs.insert(path.as_str().to_string(), fields.clone());
        Ok(())
    }

    fn remove(&self, path: &DocPath) -> Result<(), StoreError> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        docs.remove(path.as_str());
        Ok(())
    }

    fn scan(&self, collection: &CollectionPath) -> Result<Vec<StoredDoc>, StoreError> {
        let docs = self.docs.read().map_err(poisoned)?;
        let prefix = format!("{}/", collection.as_str());
        Ok(docs
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| collection.contains(key))
            .map(|(key, fields)| StoredDoc::new(&key[prefix.len()..], fields.clone()))
            .collect())
    }
}
