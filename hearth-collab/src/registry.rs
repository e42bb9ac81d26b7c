//! Room and membership records.
//!
//! ```text
//! create_room ──► add rooms/{new}        ──► users/{creator}.rooms ∪= {new}
//! join_room   ──► get rooms/{id} ──► rooms/{id}.members ∪= {uid}
//!                                ──► users/{uid}.rooms  ∪= {id}
//!                                ──► re-read rooms/{id}
//! ```
//!
//! Multi-step operations are plain sequential writes. If a later step
//! fails, earlier ones stay applied; membership writes are set unions, so
//! repeating the whole operation converges.
//!
//! Access-control rejections are published on the [`PermissionErrorBus`]
//! and also returned to the caller.

use crate::auth::Identity;
use crate::bus::PermissionErrorBus;
use crate::color::color_for_user_id;
use crate::error::{CollabError, Result};
use crate::model::{Room, UserProfile};
use crate::store::{
    path, DocumentStore, Query, StoreError, StoredDoc, WriteData, FIELD_ID, MAX_IN_VALUES,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// CRUD over rooms and user membership.
#[derive(Clone)]
pub struct RoomRegistry {
    store: Arc<dyn DocumentStore>,
    bus: PermissionErrorBus,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, bus: PermissionErrorBus) -> Self {
        Self { store, bus }
    }

    pub fn bus(&self) -> &PermissionErrorBus {
        &self.bus
    }

    /// Create a room with the creator as its only member; returns the id.
    pub async fn create_room(&self, name: &str, pdf_name: &str, creator_id: &str) -> Result<String> {
        let name = name.trim();
        let pdf_name = pdf_name.trim();
        if name.is_empty() {
            return Err(CollabError::validation("Room name is required."));
        }
        if pdf_name.is_empty() {
            return Err(CollabError::validation("A PDF file is required."));
        }
        let creator_id = user_id(creator_id)?;

        let room = WriteData::new()
            .set("name", name)
            .set("pdfName", pdf_name)
            .set("creatorId", creator_id)
            .set("members", json!([creator_id]))
            .server_timestamp("createdAt");
        let payload = room.to_json();
        let room_id = self
            .store
            .add(&path::rooms(), room)
            .await
            .map_err(|e| self.bus.capture(e, Some(payload)))?;

        self.add_room_to_user(creator_id, &room_id).await?;

        log::info!("Created room {room_id} ({name}) for {creator_id}");
        Ok(room_id)
    }

    /// Add `user_id` to the room. `Ok(None)` when the room does not exist.
    pub async fn join_room(&self, room_id: &str, user_id: &str) -> Result<Option<Room>> {
        let room_id = room_code(room_id)?;
        let user_id = self::user_id(user_id)?;

        let room_path = path::room(room_id);
        let Some(mut before) = self.fetch_room(room_id).await? else {
            log::info!("Room {room_id} does not exist");
            return Ok(None);
        };

        let patch = WriteData::new().array_union("members", vec![json!(user_id)]);
        let payload = patch.to_json();
        match self.store.update(&room_path, patch).await {
            Ok(()) => {}
            // Deleted between the read and the update
            Err(StoreError::NotFound(_)) => {
                log::info!("Room {room_id} was deleted before {user_id} could join");
                return Ok(None);
            }
            Err(e) => return Err(self.bus.capture(e, Some(payload))),
        }

        self.add_room_to_user(user_id, room_id).await?;

        match self.fetch_room_quietly(room_id).await {
            Some(room) => Ok(Some(room)),
            None => {
                if !before.is_member(user_id) {
                    before.members.push(user_id.to_string());
                }
                Ok(Some(before))
            }
        }
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Option<Room>> {
        self.fetch_room(room_code(room_id)?).await
    }

    /// Rooms listed on the user's profile, in profile order. Ids that no
    /// longer resolve are skipped.
    pub async fn get_user_rooms(&self, user_id: &str) -> Result<Vec<Room>> {
        let user_id = self::user_id(user_id)?;
        let user = self
            .store
            .get(&path::user(user_id))
            .await
            .map_err(|e| self.bus.capture(e, None))?;
        let Some(user) = user else {
            return Ok(Vec::new());
        };

        let mut room_ids: Vec<String> = Vec::new();
        if let Some(Value::Array(items)) = user.data.get("rooms") {
            for id in items.iter().filter_map(Value::as_str) {
                if !room_ids.iter().any(|seen| seen == id) {
                    room_ids.push(id.to_string());
                }
            }
        }
        if room_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut found: HashMap<String, Room> = HashMap::with_capacity(room_ids.len());
        for chunk in room_ids.chunks(MAX_IN_VALUES) {
            let ids: Vec<Value> = chunk.iter().map(|id| json!(id)).collect();
            let query = Query::collection(path::rooms()).where_in(FIELD_ID, ids);

            match self.store.query(&query).await {
                Ok(docs) => {
                    for doc in docs {
                        if let Some(room) = decode_room(&doc) {
                            found.insert(room.id.clone(), room);
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Room lookup for {} ids failed ({e}), resolving one by one", chunk.len());
                    self.bus.capture(e, None);
                    for id in chunk {
                        match self.fetch_room(id).await {
                            Ok(Some(room)) => {
                                found.insert(room.id.clone(), room);
                            }
                            Ok(None) => {}
                            Err(e) => log::debug!("Skipping room {id}: {e}"),
                        }
                    }
                }
            }
        }

        Ok(room_ids
            .into_iter()
            .filter_map(|id| found.remove(&id))
            .collect())
    }

    /// Delete a room record and drop it from the deleting user's list.
    /// Sub-collections are left in place.
    pub async fn delete_room(&self, room_id: &str, user_id: &str) -> Result<()> {
        let room_id = room_code(room_id)?;
        let user_id = self::user_id(user_id)?;
        self.store
            .delete(&path::room(room_id))
            .await
            .map_err(|e| self.bus.capture(e, None))?;

        let patch = WriteData::new().array_remove("rooms", vec![json!(room_id)]);
        let payload = patch.to_json();
        self.store
            .update(&path::user(user_id), patch)
            .await
            .map_err(|e| self.bus.capture(e, Some(payload)))?;

        log::info!("Deleted room {room_id}");
        Ok(())
    }

    /// Load the user's profile, creating it on first sign-in.
    pub async fn ensure_user(&self, identity: &Identity) -> Result<UserProfile> {
        let user_path = path::user(user_id(&identity.id)?);
        let existing = self
            .store
            .get(&user_path)
            .await
            .map_err(|e| self.bus.capture(e, None))?;

        if let Some(doc) = existing {
            return doc
                .decode()
                .map_err(|e| CollabError::Io(format!("malformed profile {}: {e}", identity.id)));
        }

        let profile = UserProfile {
            id: identity.id.clone(),
            name: identity.name_or_anonymous().to_string(),
            email: identity.email.clone(),
            photo_url: identity.avatar_url.clone(),
            color: color_for_user_id(&identity.id),
            rooms: Vec::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let data = WriteData::from_record(&profile)?.server_timestamp("createdAt");
        let payload = data.to_json();
        self.store
            .set(&user_path, data)
            .await
            .map_err(|e| self.bus.capture(e, Some(payload)))?;

        log::info!("Created profile for {}", identity.id);
        match self.store.get(&user_path).await {
            Ok(Some(doc)) => Ok(doc.decode().unwrap_or(profile)),
            _ => Ok(profile),
        }
    }

    async fn add_room_to_user(&self, user_id: &str, room_id: &str) -> Result<()> {
        let patch = WriteData::new().array_union("rooms", vec![json!(room_id)]);
        let payload = patch.to_json();
        self.store
            .update(&path::user(user_id), patch)
            .await
            .map_err(|e| self.bus.capture(e, Some(payload)))
    }

    async fn fetch_room(&self, room_id: &str) -> Result<Option<Room>> {
        let doc = self
            .store
            .get(&path::room(room_id))
            .await
            .map_err(|e| self.bus.capture(e, None))?;
        Ok(doc.as_ref().and_then(decode_room))
    }

    async fn fetch_room_quietly(&self, room_id: &str) -> Option<Room> {
        match self.store.get(&path::room(room_id)).await {
            Ok(doc) => doc.as_ref().and_then(decode_room),
            Err(e) => {
                log::debug!("Re-reading room {room_id} failed: {e}");
                None
            }
        }
    }
}

/// Trimmed room id, rejected when empty or not a single path segment.
fn room_code(room_id: &str) -> Result<&str> {
    let room_id = room_id.trim();
    if room_id.is_empty() {
        return Err(CollabError::validation("Room code is required."));
    }
    if room_id.contains('/') {
        return Err(CollabError::validation(format!("Invalid room code: {room_id}")));
    }
    Ok(room_id)
}

fn user_id(uid: &str) -> Result<&str> {
    if uid.is_empty() || uid.contains('/') {
        return Err(CollabError::validation(format!("Invalid user id: {uid:?}")));
    }
    Ok(uid)
}

fn decode_room(doc: &StoredDoc) -> Option<Room> {
    match doc.decode::<Room>() {
        Ok(room) => Some(room),
        Err(e) => {
            log::warn!("Skipping malformed room {}: {e}", doc.id);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AllowAll, LocalStore, ReadingRoomRules};

    async fn registry_for(store: &LocalStore, uid: &str) -> RoomRegistry {
        let registry = RoomRegistry::new(Arc::new(store.as_user(uid)), PermissionErrorBus::new(16));
        registry.ensure_user(&Identity::new(uid)).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_create_room_sets_membership() {
        let store = LocalStore::in_memory(ReadingRoomRules);
        let alice = registry_for(&store, "alice").await;

        let room_id = alice.create_room("Dune club", "dune.pdf", "alice").await.unwrap();
        let room = alice.get_room(&room_id).await.unwrap().unwrap();
        assert_eq!(room.members, vec!["alice"]);
        assert_eq!(room.pdf_name, "dune.pdf");
        assert!(room.created_at > 0);

        let rooms = alice.get_user_rooms("alice").await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].id, room_id);
    }

    #[tokio::test]
    async fn test_create_room_validation() {
        let store = LocalStore::in_memory(AllowAll);
        let registry = registry_for(&store, "u").await;
        assert!(matches!(
            registry.create_room("  ", "a.pdf", "u").await,
            Err(CollabError::Validation(_))
        ));
        assert!(matches!(
            registry.create_room("Room", "", "u").await,
            Err(CollabError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_join_missing_room_is_none() {
        let store = LocalStore::in_memory(ReadingRoomRules);
        let bob = registry_for(&store, "bob").await;
        assert_eq!(bob.join_room("nope", "bob").await.unwrap(), None);
        assert!(matches!(
            bob.join_room("   ", "bob").await,
            Err(CollabError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_ids_must_be_single_segments() {
        let store = LocalStore::in_memory(ReadingRoomRules);
        let bob = registry_for(&store, "bob").await;
        let mut listener = bob.bus().subscribe();

        for result in [
            bob.join_room("r1/annotations/x", "bob").await,
            bob.join_room("r1", "").await,
            bob.join_room("r1", "bob/rooms").await,
            bob.get_room("r1/messages").await,
        ] {
            assert!(matches!(result, Err(CollabError::Validation(_))), "{result:?}");
        }
        assert!(matches!(
            bob.ensure_user(&Identity::new("")).await,
            Err(CollabError::Validation(_))
        ));
        assert!(matches!(
            bob.get_user_rooms("bob/x").await,
            Err(CollabError::Validation(_))
        ));
        assert!(matches!(
            bob.create_room("R", "r.pdf", "").await,
            Err(CollabError::Validation(_))
        ));
        assert!(matches!(
            bob.delete_room("a/b", "bob").await,
            Err(CollabError::Validation(_))
        ));
        assert!(listener.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_join_room_deleted_mid_join_is_none() {
        // Reads see the room, the update finds it gone
        struct Vanishing(LocalStore);

        #[async_trait::async_trait]
        impl DocumentStore for Vanishing {
            async fn add(&self, c: &crate::store::CollectionPath, d: WriteData) -> std::result::Result<String, StoreError> {
                self.0.add(c, d).await
            }
            async fn set(&self, p: &crate::store::DocPath, d: WriteData) -> std::result::Result<(), StoreError> {
                self.0.set(p, d).await
            }
            async fn get(&self, p: &crate::store::DocPath) -> std::result::Result<Option<StoredDoc>, StoreError> {
                self.0.get(p).await
            }
            async fn update(&self, p: &crate::store::DocPath, d: WriteData) -> std::result::Result<(), StoreError> {
                if p.as_str().starts_with("rooms/") {
                    self.0.delete(p).await?;
                }
                self.0.update(p, d).await
            }
            async fn delete(&self, p: &crate::store::DocPath) -> std::result::Result<(), StoreError> {
                self.0.delete(p).await
            }
            async fn query(&self, q: &Query) -> std::result::Result<Vec<StoredDoc>, StoreError> {
                self.0.query(q).await
            }
            async fn subscribe(&self, q: Query) -> std::result::Result<crate::store::Subscription, StoreError> {
                self.0.subscribe(q).await
            }
        }

        let store = LocalStore::in_memory(AllowAll);
        let alice = registry_for(&store, "alice").await;
        let room_id = alice.create_room("Gone soon", "g.pdf", "alice").await.unwrap();

        let bus = PermissionErrorBus::new(4);
        let mut listener = bus.subscribe();
        let bob = RoomRegistry::new(Arc::new(Vanishing(store.as_user("bob"))), bus);
        assert_eq!(bob.join_room(&room_id, "bob").await.unwrap(), None);
        assert!(listener.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_ensure_user_defaults() {
        let store = LocalStore::in_memory(ReadingRoomRules);
        let registry = RoomRegistry::new(Arc::new(store.as_user("u1")), PermissionErrorBus::new(4));
        let profile = registry
            .ensure_user(&Identity::new("u1").with_email("u1@example.com"))
            .await
            .unwrap();
        assert_eq!(profile.name, "Anonymous");
        assert_eq!(profile.color, color_for_user_id("u1"));
        assert!(profile.rooms.is_empty());

        // Second sign-in keeps the stored profile
        let again = registry
            .ensure_user(&Identity::new("u1").with_display_name("Renamed"))
            .await
            .unwrap();
        assert_eq!(again.name, "Anonymous");
    }

    #[tokio::test]
    async fn test_denied_create_is_published_and_returned() {
        let store = LocalStore::in_memory(ReadingRoomRules);
        let registry = RoomRegistry::new(Arc::new(store.signed_out()), PermissionErrorBus::new(4));
        let mut listener = registry.bus().subscribe();

        let err = registry.create_room("R", "r.pdf", "ghost").await.unwrap_err();
        let perm = err.permission().unwrap();
        assert_eq!(perm.operation, crate::store::Operation::Create);
        assert_eq!(perm.request_resource_data.as_ref().unwrap()["pdfName"], json!("r.pdf"));

        let event = listener.try_recv().unwrap();
        assert_eq!(event.path, perm.path);
    }
}
