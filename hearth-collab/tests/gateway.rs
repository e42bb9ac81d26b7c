//! Integration tests for the WebSocket store gateway.
//!
//! These tests start a real gateway and connect real clients, running
//! the registry and the sync engine over the wire.

use hearth_collab::auth::Identity;
use hearth_collab::bus::PermissionErrorBus;
use hearth_collab::client::{ClientConfig, ConnectionState, RemoteStore};
use hearth_collab::error::CollabError;
use hearth_collab::registry::RoomRegistry;
use hearth_collab::server::{GatewayConfig, StoreGateway};
use hearth_collab::store::{
    path, DocumentStore, LocalStore, Operation, Query, ReadingRoomRules, StoreError, WriteData,
};
use hearth_collab::sync::{Author, RoomView, SubscriptionState, SyncEngine};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

const USERS: [&str; 3] = ["alice", "bob", "mallory"];

fn token_for(uid: &str) -> String {
    format!("token-{uid}")
}

/// Start a gateway on a free port, return its URL and bus. Every user in
/// `USERS` signs in with `token_for(uid)`.
async fn start_gateway(max_subscriptions: usize) -> (String, PermissionErrorBus) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = GatewayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_subscriptions_per_connection: max_subscriptions,
        tokens: USERS.iter().map(|uid| (token_for(uid), uid.to_string())).collect(),
        trust_client_uid: false,
    };
    let bus = PermissionErrorBus::new(16);
    let gateway = StoreGateway::new(config, LocalStore::in_memory(ReadingRoomRules)).with_bus(bus.clone());
    tokio::spawn(async move {
        gateway.serve(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), bus)
}

async fn connect(url: &str, uid: Option<&str>) -> RemoteStore {
    let token = uid.map(token_for);
    RemoteStore::connect(url, token.as_deref(), ClientConfig::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_client_connects() {
    let (url, _) = start_gateway(8).await;
    let client = connect(&url, Some("alice")).await;
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client.uid(), Some("alice"));
    client.send_ping().unwrap();
}

#[tokio::test]
async fn test_crud_round_trip() {
    let (url, _) = start_gateway(8).await;
    let client = connect(&url, Some("alice")).await;

    let profile = path::user("alice");
    client
        .set(&profile, WriteData::new().set("name", "Alice").server_timestamp("createdAt"))
        .await
        .unwrap();
    client
        .update(&profile, WriteData::new().array_union("rooms", vec!["r1".into(), "r1".into()]))
        .await
        .unwrap();

    let doc = client.get(&profile).await.unwrap().unwrap();
    assert_eq!(doc.id, "alice");
    assert_eq!(doc.get("rooms"), Some(&serde_json::json!(["r1"])));
    assert!(doc.get("createdAt").and_then(|v| v.as_i64()).unwrap() > 0);

    assert!(client.get(&path::user("nobody")).await.unwrap().is_none());
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_denied_request_crosses_the_wire() {
    let (url, bus) = start_gateway(8).await;
    let mut listener = bus.subscribe();
    let client = connect(&url, Some("bob")).await;

    let err = client
        .set(&path::user("alice"), WriteData::new().set("name", "not bob"))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::denied("users/alice", Operation::Create));

    let event = timeout(Duration::from_secs(2), listener.recv()).await.unwrap().unwrap();
    assert_eq!(event.path, "users/alice");
    assert!(event.request_resource_data.is_some());

    // Update of a missing document is NotFound, not a transport error
    let err = client
        .update(&path::user("bob"), WriteData::new().set("name", "Bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn test_signed_out_connection_is_denied() {
    let (url, _) = start_gateway(8).await;
    let client = connect(&url, None).await;
    let err = client.get(&path::user("alice")).await.unwrap_err();
    assert!(err.is_permission_denied());
}

#[tokio::test]
async fn test_live_query_over_the_wire() {
    let (url, _) = start_gateway(8).await;
    let client = connect(&url, Some("alice")).await;
    client.set(&path::user("alice"), WriteData::new().set("name", "A")).await.unwrap();

    let mut sub = client.subscribe(Query::collection(path::users())).await.unwrap();
    let first = timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(first.docs.len(), 1);

    let other = connect(&url, Some("bob")).await;
    other.set(&path::user("bob"), WriteData::new().set("name", "B")).await.unwrap();

    let second = timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(second.docs.len(), 2);
    assert_eq!(client.open_subscriptions(), 1);

    sub.unsubscribe();
    assert_eq!(client.open_subscriptions(), 0);
}

#[tokio::test]
async fn test_subscription_limit() {
    let (url, _) = start_gateway(1).await;
    let client = connect(&url, Some("alice")).await;

    let _first = client.subscribe(Query::collection(path::users())).await.unwrap();
    let err = client.subscribe(Query::collection(path::rooms())).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));
    assert_eq!(client.open_subscriptions(), 1);
}

#[tokio::test]
async fn test_forged_hello_is_rejected() {
    let (url, _) = start_gateway(8).await;

    // A bare uid is not a token
    let err = RemoteStore::connect(&url, Some("alice"), ClientConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Unauthenticated(_)), "{err:?}");

    let err = RemoteStore::connect(&url, Some("token-carol"), ClientConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Unauthenticated(_)), "{err:?}");

    // A valid token binds its own uid, not one the client picks
    let bob = connect(&url, Some("bob")).await;
    assert_eq!(bob.uid(), Some("bob"));
    let err = bob
        .set(&path::user("alice"), WriteData::new().set("name", "not bob"))
        .await
        .unwrap_err();
    assert!(err.is_permission_denied());
}

#[tokio::test]
async fn test_trusted_network_gateway_takes_claimed_uid() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = GatewayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        trust_client_uid: true,
        ..GatewayConfig::for_testing()
    };
    let gateway = StoreGateway::new(config, LocalStore::in_memory(ReadingRoomRules));
    tokio::spawn(async move {
        gateway.serve(listener).await.unwrap();
    });

    let client = RemoteStore::connect(format!("ws://127.0.0.1:{port}"), Some("alice"), ClientConfig::default())
        .await
        .unwrap();
    assert_eq!(client.uid(), Some("alice"));
    client.set(&path::user("alice"), WriteData::new().set("name", "A")).await.unwrap();
}

#[tokio::test]
async fn test_denied_subscriptions_release_slots() {
    let (url, _) = start_gateway(2).await;
    let alice = RoomRegistry::new(Arc::new(connect(&url, Some("alice")).await), PermissionErrorBus::default());
    alice.ensure_user(&Identity::new("alice")).await.unwrap();
    let room_id = alice.create_room("Private", "p.pdf", "alice").await.unwrap();

    let mallory = connect(&url, Some("mallory")).await;
    let messages = Query::collection(path::room(&room_id).collection("messages"));
    for _ in 0..5 {
        let mut sub = mallory.subscribe(messages.clone()).await.unwrap();
        let first = timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap();
        assert!(first.unwrap_err().is_permission_denied());
        drop(sub);
    }

    // Both slots are free again
    let mut first = mallory.subscribe(Query::collection(path::users())).await.unwrap();
    let _second = mallory.subscribe(Query::collection(path::users())).await.unwrap();
    timeout(Duration::from_secs(2), first.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(mallory.open_subscriptions(), 2);
}

#[tokio::test]
async fn test_disconnect_ends_subscriptions() {
    let (url, _) = start_gateway(8).await;
    let client = connect(&url, Some("alice")).await;
    let mut sub = client.subscribe(Query::collection(path::users())).await.unwrap();
    timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap().unwrap();

    client.disconnect();

    let last = timeout(Duration::from_secs(2), sub.next()).await.unwrap().unwrap();
    assert!(matches!(last, Err(StoreError::Transport(_))));
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert!(client.get(&path::user("alice")).await.is_err());
}

#[tokio::test]
async fn test_reading_room_over_gateway() {
    let (url, _) = start_gateway(8).await;

    let alice_store: Arc<dyn DocumentStore> = Arc::new(connect(&url, Some("alice")).await);
    let bob_store: Arc<dyn DocumentStore> = Arc::new(connect(&url, Some("bob")).await);
    let alice = RoomRegistry::new(alice_store.clone(), PermissionErrorBus::default());
    let bob = RoomRegistry::new(bob_store.clone(), PermissionErrorBus::default());

    let alice_profile = alice
        .ensure_user(&Identity::new("alice").with_display_name("Alice"))
        .await
        .unwrap();
    let bob_profile = bob.ensure_user(&Identity::new("bob")).await.unwrap();

    let room_id = alice.create_room("Club", "club.pdf", "alice").await.unwrap();
    let room = bob.join_room(&room_id, "bob").await.unwrap().unwrap();
    assert_eq!(room.members.len(), 2);

    let alice_session = SyncEngine::new(alice_store, PermissionErrorBus::default(), Author::from(&alice_profile))
        .enter_room(&room_id)
        .await
        .unwrap();
    let bob_session = SyncEngine::new(bob_store, PermissionErrorBus::default(), Author::from(&bob_profile))
        .enter_room(&room_id)
        .await
        .unwrap();

    let mut bob_view = bob_session.changes();
    timeout(Duration::from_secs(2), bob_view.wait_for(|v: &RoomView| v.is_live()))
        .await
        .unwrap()
        .unwrap();

    assert!(alice_session.add_message("chapter two?").unwrap().finished().await);

    let view = timeout(
        Duration::from_secs(2),
        bob_view.wait_for(|v: &RoomView| v.messages.len() == 1),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(view.messages.records[0].user_name, "Alice");
    assert_eq!(view.messages.state, SubscriptionState::Live);

    // Non-members are rejected by the gateway's rules
    let mallory = RoomRegistry::new(Arc::new(connect(&url, Some("mallory")).await), PermissionErrorBus::default());
    assert!(matches!(
        mallory.delete_room(&room_id, "mallory").await,
        Err(CollabError::PermissionDenied(_))
    ));
}
