//! Persistence integration tests.
//!
//! Verifies:
//! - Rooms, profiles and room records survive a close/reopen cycle
//! - Live sessions work unchanged on top of RocksDB
//! - Collections in different rooms stay isolated on disk

use hearth_collab::auth::Identity;
use hearth_collab::bus::PermissionErrorBus;
use hearth_collab::model::AnnotationDraft;
use hearth_collab::registry::RoomRegistry;
use hearth_collab::store::{
    path, DocumentStore, LocalStore, Query, ReadingRoomRules, RocksBackend, StoreConfig,
};
use hearth_collab::sync::{Author, RoomView, SyncEngine};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::{timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open(dir: &std::path::Path) -> LocalStore<RocksBackend> {
    let backend = RocksBackend::open(StoreConfig::for_testing(dir)).unwrap();
    LocalStore::new(backend, ReadingRoomRules)
}

async fn registry(store: &LocalStore<RocksBackend>, uid: &str) -> (RoomRegistry, Author) {
    let handle: Arc<dyn DocumentStore> = Arc::new(store.as_user(uid));
    let registry = RoomRegistry::new(handle, PermissionErrorBus::default());
    let profile = registry.ensure_user(&Identity::new(uid)).await.unwrap();
    (registry, Author::from(&profile))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rooms_survive_reopen() {
    let dir = tempdir().unwrap();

    let room_id = {
        let store = open(dir.path());
        let (alice, _) = registry(&store, "alice").await;
        let (bob, _) = registry(&store, "bob").await;
        let room_id = alice.create_room("Dune club", "dune.pdf", "alice").await.unwrap();
        bob.join_room(&room_id, "bob").await.unwrap().unwrap();
        store.backend().sync().unwrap();
        room_id
    };

    let store = open(dir.path());
    let (bob, author) = registry(&store, "bob").await;
    assert_eq!(author.name, "Anonymous");

    let rooms = bob.get_user_rooms("bob").await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].id, room_id);
    assert_eq!(rooms[0].pdf_name, "dune.pdf");
    assert!(rooms[0].is_member("alice"));
    assert!(rooms[0].is_member("bob"));
}

#[tokio::test]
async fn test_session_over_rocksdb() {
    let dir = tempdir().unwrap();

    let room_id = {
        let store = open(dir.path());
        let (alice, author) = registry(&store, "alice").await;
        let room_id = alice.create_room("Club", "c.pdf", "alice").await.unwrap();

        let engine = SyncEngine::new(Arc::new(store.as_user("alice")), PermissionErrorBus::default(), author);
        let session = engine.enter_room(&room_id).await.unwrap();
        assert!(session
            .add_annotation(AnnotationDraft::new(2, 25.0, 75.0, "remember this"))
            .unwrap()
            .finished()
            .await);

        let mut rx = session.changes();
        timeout(
            Duration::from_secs(2),
            rx.wait_for(|v: &RoomView| v.annotations.len() == 1 && v.messages.len() == 1),
        )
        .await
        .unwrap()
        .unwrap();
        room_id
    };
    // Aborted subscription tasks release their store handle on the next tick
    tokio::time::sleep(Duration::from_millis(100)).await;

    let store = open(dir.path());
    let reader = store.as_user("alice");
    let room = path::room(&room_id);

    let annotations = reader
        .query(&Query::collection(room.collection("annotations")))
        .await
        .unwrap();
    assert_eq!(annotations.len(), 1);
    assert_eq!(
        annotations[0].get("content").and_then(|v| v.as_str()),
        Some("remember this")
    );

    let messages = reader
        .query(&Query::collection(room.collection("messages")).where_eq("type", "system"))
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn test_rooms_isolated_on_disk() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let (alice, author) = registry(&store, "alice").await;
    let first = alice.create_room("One", "1.pdf", "alice").await.unwrap();
    let second = alice.create_room("Two", "2.pdf", "alice").await.unwrap();

    let engine = SyncEngine::new(Arc::new(store.as_user("alice")), PermissionErrorBus::default(), author);
    let session = engine.enter_room(&first).await.unwrap();
    for text in ["a", "b", "c"] {
        assert!(session.add_message(text).unwrap().finished().await);
    }

    let reader = store.as_user("alice");
    let in_first = reader
        .query(&Query::collection(path::room(&first).collection("messages")))
        .await
        .unwrap();
    let in_second = reader
        .query(&Query::collection(path::room(&second).collection("messages")))
        .await
        .unwrap();
    assert_eq!(in_first.len(), 3);
    assert!(in_second.is_empty());

    // Room collection scan does not see nested records
    let rooms = reader.query(&Query::collection(path::rooms())).await.unwrap();
    assert_eq!(rooms.len(), 2);
}
