//! In-process document store.
//!
//! `LocalStore` evaluates access rules, applies field transforms and fans
//! out change notices to live queries. Persistence is delegated to a
//! [`StorageBackend`] (memory or RocksDB).
//!
//! ```text
//! write ──► rules ──► backend.save ──► changes.send(collection)
//!                                              │
//!              ┌───────────────────────────────┼──────────────┐
//!              ▼                               ▼              ▼
//!        subscription task              subscription task    ...
//!        (re-run query, send Snapshot)
//! ```
//!
//! Backend access (RocksDB reads and writes, the write lock) runs on
//! tokio's blocking pool, never on a runtime worker.
//!
//! Handles are cheap to clone. Each handle carries the uid that rules
//! evaluate against; [`LocalStore::as_user`] derives a handle for another
//! identity over the same data.

use super::backend::{MemoryBackend, StorageBackend};
use super::rules::{AccessPolicy, AccessRequest};
use super::{
    CollectionPath, DocPath, DocumentStore, Fields, Operation, Query, Snapshot, StoreError,
    StoredDoc, Subscription, WriteData,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Capacity of the change-notice channel.
const CHANGE_CAPACITY: usize = 1024;

struct Shared<B> {
    backend: B,
    policy: Box<dyn AccessPolicy>,
    changes: broadcast::Sender<CollectionPath>,
    /// Serializes read-check-write sequences. Never held across `.await`.
    write_lock: Mutex<()>,
}

/// Document store running in this process.
pub struct LocalStore<B: StorageBackend = MemoryBackend> {
    shared: Arc<Shared<B>>,
    auth: Option<String>,
}

impl<B: StorageBackend> Clone for LocalStore<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            auth: self.auth.clone(),
        }
    }
}

impl LocalStore<MemoryBackend> {
    /// Signed-out handle over a fresh in-memory backend.
    pub fn in_memory(policy: impl AccessPolicy + 'static) -> Self {
        Self::new(MemoryBackend::new(), policy)
    }
}

impl<B: StorageBackend> LocalStore<B> {
    /// Signed-out handle over `backend`.
    pub fn new(backend: B, policy: impl AccessPolicy + 'static) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                backend,
                policy: Box::new(policy),
                changes,
                write_lock: Mutex::new(()),
            }),
            auth: None,
        }
    }

    /// Handle bound to `uid` over the same data.
    pub fn as_user(&self, uid: impl Into<String>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            auth: Some(uid.into()),
        }
    }

    /// Handle with no identity over the same data.
    pub fn signed_out(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            auth: None,
        }
    }

    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Number of live subscriptions across all handles.
    pub fn subscriber_count(&self) -> usize {
        self.shared.changes.receiver_count()
    }

    /// Run `op` on the blocking pool with this handle's identity.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Shared<B>, Option<&str>) -> Result<T, StoreError> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let auth = self.auth.clone();
        tokio::task::spawn_blocking(move || op(&shared, auth.as_deref()))
            .await
            .map_err(|e| StoreError::Database(format!("store task failed: {e}")))?
    }
}

impl<B: StorageBackend> Shared<B> {
    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded section only touches the backend, which keeps its own
        // consistency, so a poisoned lock is still usable.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(
        &self,
        auth: Option<&str>,
        path: &str,
        operation: Operation,
        existing: Option<&Fields>,
        incoming: Option<&Fields>,
    ) -> Result<(), StoreError> {
        let req = AccessRequest {
            auth,
            path,
            operation,
            existing,
            incoming,
        };
        let backend = &self.backend;
        let lookup = |p: &str| backend.load(&DocPath::new(p)).ok().flatten();

        if self.policy.allows(&req, &lookup) {
            Ok(())
        } else {
            log::debug!(
                "Denied {operation} on {path} for {}",
                auth.unwrap_or("<signed out>")
            );
            Err(StoreError::denied(path, operation))
        }
    }

    fn notify(&self, collection: CollectionPath) {
        self.changes.send(collection).unwrap_or(0);
    }

    fn write_create(&self, auth: Option<&str>, path: &DocPath, data: &WriteData) -> Result<(), StoreError> {
        let _guard = self.lock();
        let incoming = data.resolve(None, now_millis());
        self.check(auth, path.as_str(), Operation::Create, None, Some(&incoming))?;
        self.backend.save(path, &incoming)?;
        drop(_guard);
        self.notify(path.parent());
        Ok(())
    }

    fn write_set(&self, auth: Option<&str>, path: &DocPath, data: &WriteData) -> Result<(), StoreError> {
        let _guard = self.lock();
        let existing = self.backend.load(path)?;
        let incoming = data.resolve(None, now_millis());
        let operation = if existing.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };
        self.check(auth, path.as_str(), operation, existing.as_ref(), Some(&incoming))?;
        self.backend.save(path, &incoming)?;
        drop(_guard);
        self.notify(path.parent());
        Ok(())
    }

    fn write_update(&self, auth: Option<&str>, path: &DocPath, patch: &WriteData) -> Result<(), StoreError> {
        let _guard = self.lock();
        let Some(existing) = self.backend.load(path)? else {
            // Absence is only reported to callers allowed to read the path
            self.check(auth, path.as_str(), Operation::Get, None, None)?;
            return Err(StoreError::NotFound(path.to_string()));
        };
        let incoming = patch.resolve(Some(&existing), now_millis());
        self.check(
            auth,
            path.as_str(),
            Operation::Update,
            Some(&existing),
            Some(&incoming),
        )?;
        self.backend.save(path, &incoming)?;
        drop(_guard);
        self.notify(path.parent());
        Ok(())
    }

    fn write_delete(&self, auth: Option<&str>, path: &DocPath) -> Result<(), StoreError> {
        let _guard = self.lock();
        let existing = self.backend.load(path)?;
        self.check(auth, path.as_str(), Operation::Delete, existing.as_ref(), None)?;
        if existing.is_none() {
            return Ok(());
        }
        self.backend.remove(path)?;
        drop(_guard);
        self.notify(path.parent());
        Ok(())
    }

    fn read(&self, auth: Option<&str>, path: &DocPath) -> Result<Option<StoredDoc>, StoreError> {
        let existing = self.backend.load(path)?;
        self.check(auth, path.as_str(), Operation::Get, existing.as_ref(), None)?;
        Ok(existing.map(|data| StoredDoc::new(path.id(), data)))
    }

    fn run_query(&self, auth: Option<&str>, query: &Query) -> Result<Vec<StoredDoc>, StoreError> {
        query.validate()?;
        self.check(auth, query.collection.as_str(), Operation::List, None, None)?;
        let docs = self.backend.scan(&query.collection)?;
        Ok(docs.into_iter().filter(|d| query.matches(d)).collect())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl<B: StorageBackend> DocumentStore for LocalStore<B> {
    async fn add(&self, collection: &CollectionPath, data: WriteData) -> Result<String, StoreError> {
        let id = generate_id();
        let path = collection.doc(&id);
        self.blocking(move |shared, auth| shared.write_create(auth, &path, &data))
            .await?;
        Ok(id)
    }

    async fn set(&self, path: &DocPath, data: WriteData) -> Result<(), StoreError> {
        let path = path.clone();
        self.blocking(move |shared, auth| shared.write_set(auth, &path, &data))
            .await
    }

    async fn get(&self, path: &DocPath) -> Result<Option<StoredDoc>, StoreError> {
        let path = path.clone();
        self.blocking(move |shared, auth| shared.read(auth, &path)).await
    }

    async fn update(&self, path: &DocPath, patch: WriteData) -> Result<(), StoreError> {
        let path = path.clone();
        self.blocking(move |shared, auth| shared.write_update(auth, &path, &patch))
            .await
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        let path = path.clone();
        self.blocking(move |shared, auth| shared.write_delete(auth, &path))
            .await
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredDoc>, StoreError> {
        let query = query.clone();
        self.blocking(move |shared, auth| shared.run_query(auth, &query))
            .await
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        query.validate()?;

        // Subscribe to notices before the first read so no change is missed
        let mut changes = self.shared.changes.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();

        let task = tokio::spawn(async move {
            let mut last: Option<Snapshot> = None;
            loop {
                let current = query.clone();
                match store
                    .blocking(move |shared, auth| shared.run_query(auth, &current))
                    .await
                {
                    Ok(docs) => {
                        let snapshot = Snapshot { docs };
                        if last.as_ref() != Some(&snapshot) {
                            if tx.send(Ok(snapshot.clone())).is_err() {
                                return;
                            }
                            last = Some(snapshot);
                        }
                    }
                    Err(e) => {
                        // Terminal: the listener is dead after an error
                        let _ = tx.send(Err(e));
                        return;
                    }
                }

                loop {
                    match changes.recv().await {
                        Ok(collection) if collection == query.collection => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(n)) => {
                            log::debug!("Subscription on {} lagged by {n} notices", query.collection);
                            break;
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        });

        Ok(Subscription::new(rx, move || task.abort()))
    }
}
