//! Persisted records.
//!
//! Field names are camelCase on the wire. Document ids live in the store
//! path, not in the document body: records are serialized without `id`
//! and decoded with the id injected (see [`StoredDoc::decode`]).
//!
//! [`StoredDoc::decode`]: crate::store::StoredDoc::decode

use crate::color::Color;
use serde::{Deserialize, Serialize};

/// Author id used for system chat messages.
pub const SYSTEM_USER_ID: &str = "system";
/// Display name used for system chat messages.
pub const SYSTEM_USER_NAME: &str = "System";
/// Display name for identities without one.
pub const ANONYMOUS_NAME: &str = "Anonymous";

/// A shared reading session around one PDF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    #[serde(default, skip_serializing)]
    pub id: String,
    pub name: String,
    pub pdf_name: String,
    pub creator_id: String,
    #[serde(default)]
    pub members: Vec<String>,
    /// Epoch millis, store-assigned
    #[serde(default)]
    pub created_at: i64,
}

impl Room {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }
}

/// User profile document, `users/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default, skip_serializing)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "photoURL", default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    pub color: Color,
    #[serde(default)]
    pub rooms: Vec<String>,
    #[serde(default)]
    pub created_at: i64,
}

/// Note pinned at a page position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    #[serde(default, skip_serializing)]
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub page_number: u32,
    /// Percent of page width
    pub x: f64,
    /// Percent of page height
    pub y: f64,
    pub content: String,
    #[serde(default)]
    pub timestamp: i64,
    pub color: Color,
}

/// Rectangle in page-relative percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HighlightRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl HighlightRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    #[serde(default, skip_serializing)]
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub page_number: u32,
    pub rects: Vec<HighlightRect>,
    pub color: Color,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing)]
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

impl ChatMessage {
    pub fn is_system(&self) -> bool {
        self.kind == MessageKind::System
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    #[serde(default, skip_serializing)]
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub page_number: u32,
    #[serde(default)]
    pub timestamp: i64,
}

/// Per-room sub-collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomCollection {
    Annotations,
    Highlights,
    Messages,
    Bookmarks,
}

impl RoomCollection {
    pub const ALL: [RoomCollection; 4] = [
        RoomCollection::Annotations,
        RoomCollection::Highlights,
        RoomCollection::Messages,
        RoomCollection::Bookmarks,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RoomCollection::Annotations => "annotations",
            RoomCollection::Highlights => "highlights",
            RoomCollection::Messages => "messages",
            RoomCollection::Bookmarks => "bookmarks",
        }
    }
}

/// A record stored in a room sub-collection.
pub trait RoomRecord: Clone + PartialEq + serde::de::DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: RoomCollection;

    fn id(&self) -> &str;

    /// Primary display ordering key; ties break on id.
    fn order_key(&self) -> (i64, i64);
}

impl RoomRecord for Annotation {
    const COLLECTION: RoomCollection = RoomCollection::Annotations;

    fn id(&self) -> &str {
        &self.id
    }

    fn order_key(&self) -> (i64, i64) {
        (self.timestamp, 0)
    }
}

impl RoomRecord for Highlight {
    const COLLECTION: RoomCollection = RoomCollection::Highlights;

    fn id(&self) -> &str {
        &self.id
    }

    fn order_key(&self) -> (i64, i64) {
        (self.timestamp, 0)
    }
}

impl RoomRecord for ChatMessage {
    const COLLECTION: RoomCollection = RoomCollection::Messages;

    fn id(&self) -> &str {
        &self.id
    }

    fn order_key(&self) -> (i64, i64) {
        (self.timestamp, 0)
    }
}

impl RoomRecord for Bookmark {
    const COLLECTION: RoomCollection = RoomCollection::Bookmarks;

    fn id(&self) -> &str {
        &self.id
    }

    // Bookmarks list by page
    fn order_key(&self) -> (i64, i64) {
        (i64::from(self.page_number), self.timestamp)
    }
}

/// Caller-supplied part of a new annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationDraft {
    pub page_number: u32,
    pub x: f64,
    pub y: f64,
    pub content: String,
}

impl AnnotationDraft {
    pub fn new(page_number: u32, x: f64, y: f64, content: impl Into<String>) -> Self {
        Self {
            page_number,
            x,
            y,
            content: content.into(),
        }
    }
}

/// Caller-supplied part of a new highlight.
#[derive(Debug, Clone, PartialEq)]
pub struct HighlightDraft {
    pub page_number: u32,
    pub rects: Vec<HighlightRect>,
    /// Defaults to the author's color at highlight opacity
    pub color: Option<Color>,
}

impl HighlightDraft {
    pub fn new(page_number: u32, rects: Vec<HighlightRect>) -> Self {
        Self {
            page_number,
            rects,
            color: None,
        }
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = Some(color);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_room_wire_format() {
        let room = Room {
            id: "r1".into(),
            name: "Dune".into(),
            pdf_name: "dune.pdf".into(),
            creator_id: "u1".into(),
            members: vec!["u1".into()],
            created_at: 42,
        };
        let v = serde_json::to_value(&room).unwrap();
        assert_eq!(
            v,
            json!({ "name": "Dune", "pdfName": "dune.pdf", "creatorId": "u1", "members": ["u1"], "createdAt": 42 })
        );
    }

    #[test]
    fn test_message_kind_field_is_type() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "id": "m1", "userId": "system", "userName": "System",
            "message": "hi", "timestamp": 1, "type": "system"
        }))
        .unwrap();
        assert!(msg.is_system());

        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], json!("system"));
        assert!(v.get("id").is_none());
    }

    #[test]
    fn test_user_photo_url_rename() {
        let user: UserProfile = serde_json::from_value(json!({
            "id": "u1", "name": "Ada", "photoURL": "http://x/p.png",
            "color": "hsl(1, 70%, 60%)"
        }))
        .unwrap();
        assert_eq!(user.photo_url.as_deref(), Some("http://x/p.png"));
        assert!(user.rooms.is_empty());
    }

    #[test]
    fn test_bookmark_order_key_by_page() {
        let b = Bookmark {
            id: "b".into(),
            user_id: "u".into(),
            user_name: "U".into(),
            page_number: 7,
            timestamp: 100,
        };
        assert_eq!(b.order_key(), (7, 100));
    }

    #[test]
    fn test_collection_names() {
        let names: Vec<&str> = RoomCollection::ALL.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["annotations", "highlights", "messages", "bookmarks"]);
    }
}
