//! # hearth-collab: Shared-reading sync layer for HearthLink
//!
//! Reading rooms let a group read one PDF together: annotations, area
//! highlights, chat and bookmarks are shared live through a document store
//! with server-side access rules.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   create/join/list   ┌───────────────────┐
//! │ RoomRegistry │ ───────────────────► │                   │
//! └──────────────┘                      │  dyn DocumentStore│
//! ┌──────────────┐  live queries/writes │  (LocalStore or   │
//! │ SyncEngine   │ ◄──────────────────► │   RemoteStore)    │
//! │ └ RoomSession│                      └─────────┬─────────┘
//! └──────┬───────┘                                │ WebSocket
//!        │ denied writes/subscriptions  ┌─────────┴─────────┐
//!        ▼                              │ StoreGateway      │
//! ┌────────────────────┐                │ └ RocksDB backend │
//! │ PermissionErrorBus │                └───────────────────┘
//! └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: document store contract, access rules, memory/RocksDB backends
//! - [`registry`]: room and user-profile lifecycle
//! - [`sync`]: per-room live views and fire-and-forget writes
//! - [`bus`]: permission-error fan-out
//! - [`protocol`] / [`server`] / [`client`]: store access over WebSocket
//! - [`auth`], [`document`], [`suggest`]: external capabilities

pub mod auth;
pub mod bus;
pub mod client;
pub mod color;
pub mod config;
pub mod document;
pub mod error;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;
pub mod suggest;
pub mod sync;

// Re-exports for convenience
pub use auth::{
    sign_in, Identity, IdentityProvider, StaticIdentityProvider, StaticTokenVerifier, TokenVerifier,
    TrustedNetworkVerifier,
};
pub use bus::{spawn_reporter, BusStats, PermissionErrorBus, PermissionErrorListener};
pub use client::{ClientConfig, ConnectionState, RemoteStore};
pub use color::{color_for_user_id, Color};
pub use config::{ConfigError, HearthConfig};
pub use document::{PdfDocument, PdfRenderer, SelectedFile};
pub use error::{CollabError, PermissionError, Result};
pub use model::{
    Annotation, AnnotationDraft, Bookmark, ChatMessage, Highlight, HighlightDraft, HighlightRect,
    MessageKind, Room, RoomCollection, UserProfile,
};
pub use protocol::{FrameType, ProtocolError, StoreFrame};
pub use registry::RoomRegistry;
pub use server::{GatewayConfig, GatewayStats, StoreGateway};
pub use store::{
    DocumentStore, LocalStore, MemoryBackend, ReadingRoomRules, RocksBackend, StoreConfig,
    StoreError,
};
pub use suggest::{suggest_for_page, Suggestion, TextAnalyzer};
pub use sync::{Author, BookmarkToggle, PendingWrite, RoomSession, RoomView, SubscriptionState, SyncEngine};
