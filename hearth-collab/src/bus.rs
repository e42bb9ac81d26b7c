//! Permission-error broadcast channel.
//!
//! Decouples "a request was rejected by access control" from "where the
//! rejection is displayed". Producers (registry, sync engine) publish; the
//! application shell mounts a listener. The bus is an explicit value passed
//! to whoever needs it, never a global.
//!
//! ```text
//!  RoomRegistry ─┐                               ┌─► reporter (shell)
//!  RoomSession  ─┼─► PermissionErrorBus (tokio ──┼─► test listener
//!  ...          ─┘     broadcast, bounded)       └─► ...
//! ```
//!
//! Each listener buffers up to `capacity` events. A listener that falls
//! behind skips the missed events (counted in [`BusStats::dropped`]) rather
//! than blocking producers.

use crate::error::{CollabError, PermissionError};
use crate::store::StoreError;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;

/// The single topic carried by the bus.
pub const PERMISSION_ERROR_TOPIC: &str = "permission-error";

/// Default per-listener buffer.
pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    /// Events skipped by lagging listeners
    pub dropped: u64,
    pub listeners: usize,
}

struct AtomicBusStats {
    published: AtomicU64,
    dropped: AtomicU64,
}

impl AtomicBusStats {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }
}

/// Publish/subscribe bus for [`PermissionError`]s.
#[derive(Clone)]
pub struct PermissionErrorBus {
    sender: broadcast::Sender<Arc<PermissionError>>,
    capacity: usize,
    stats: Arc<AtomicBusStats>,
}

impl PermissionErrorBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBusStats::new()),
        }
    }

    /// Publish to every current listener; returns how many received it.
    /// Publishing with no listeners is a no-op.
    pub fn publish(&self, error: PermissionError) -> usize {
        let count = self.sender.send(Arc::new(error)).unwrap_or(0);
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Convert a store error for the caller, publishing it first when it
    /// is an access-control rejection.
    pub fn capture(&self, err: StoreError, data: Option<Value>) -> CollabError {
        let err = CollabError::from_store(err, data);
        if let Some(perm) = err.permission() {
            log::warn!("Permission denied: {} on {}", perm.operation, perm.path);
            self.publish(perm.clone());
        }
        err
    }

    /// New listener. Only events published after this call are delivered.
    pub fn subscribe(&self) -> PermissionErrorListener {
        PermissionErrorListener {
            receiver: self.sender.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            listeners: self.sender.receiver_count(),
        }
    }
}

impl Default for PermissionErrorBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl std::fmt::Debug for PermissionErrorBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionErrorBus")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A subscription to the bus. Dropping it unsubscribes.
pub struct PermissionErrorListener {
    receiver: broadcast::Receiver<Arc<PermissionError>>,
    stats: Arc<AtomicBusStats>,
}

impl PermissionErrorListener {
    /// Next event, skipping any this listener lagged past. None once every
    /// bus handle is gone.
    pub async fn recv(&mut self) -> Option<Arc<PermissionError>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    self.stats.dropped.fetch_add(n, Ordering::Relaxed);
                    log::warn!("Permission-error listener lagged, skipped {n} events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<PermissionError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => {
                    self.stats.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

/// Mount the application-shell listener: every event is handed to `sink`
/// until the bus is dropped or the task is aborted.
pub fn spawn_reporter<F>(bus: &PermissionErrorBus, sink: F) -> JoinHandle<()>
where
    F: Fn(&PermissionError) + Send + 'static,
{
    let mut listener = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = listener.recv().await {
            sink(&event);
        }
    })
}
