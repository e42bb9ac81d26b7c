//! Local view state mirrored from live subscriptions.
//!
//! Every snapshot replaces a collection wholesale. The replacement is the
//! pure reducer [`apply_snapshot`], which knows nothing about transports:
//!
//! ```text
//! previous view + Snapshot ──apply_snapshot──► next view
//!                                               (sorted, revision bumped
//!                                                only if records changed)
//! ```

use crate::model::{Annotation, Bookmark, ChatMessage, Highlight, RoomRecord};
use crate::store::Snapshot;

/// Lifecycle of one collection subscription.
///
/// ```text
/// Unsubscribed ──enter──► Subscribing ──first snapshot──► Live
///                              │                           │
///                              └──────── error ───────► Error
///  (leave from any state) ──────────────────────────► Unsubscribed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Subscribing,
    Live,
    Error,
}

/// Ordered local copy of one room collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionView<T> {
    pub state: SubscriptionState,
    pub records: Vec<T>,
    /// Incremented every time `records` changes
    pub revision: u64,
}

impl<T> Default for CollectionView<T> {
    fn default() -> Self {
        Self {
            state: SubscriptionState::Unsubscribed,
            records: Vec::new(),
            revision: 0,
        }
    }
}

impl<T: RoomRecord> CollectionView<T> {
    pub fn is_live(&self) -> bool {
        self.state == SubscriptionState::Live
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.records.iter()
    }
}

/// Replace `previous` with the contents of `snapshot`.
///
/// Records are ordered by [`RoomRecord::order_key`] then id. Documents that
/// fail to decode are skipped. Re-applying an identical snapshot returns a
/// view equal to `previous` (same revision).
pub fn apply_snapshot<T: RoomRecord>(previous: &CollectionView<T>, snapshot: &Snapshot) -> CollectionView<T> {
    let records = decode_snapshot::<T>(snapshot);
    let changed = records != previous.records;
    CollectionView {
        state: SubscriptionState::Live,
        revision: if changed {
            previous.revision + 1
        } else {
            previous.revision
        },
        records: if changed {
            records
        } else {
            previous.records.clone()
        },
    }
}

/// Decode and order the documents of a snapshot.
pub fn decode_snapshot<T: RoomRecord>(snapshot: &Snapshot) -> Vec<T> {
    let mut records: Vec<T> = snapshot
        .docs
        .iter()
        .filter_map(|doc| match doc.decode::<T>() {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("Skipping malformed {} record {}: {e}", T::COLLECTION.name(), doc.id);
                None
            }
        })
        .collect();
    sort_records(&mut records);
    records
}

pub fn sort_records<T: RoomRecord>(records: &mut [T]) {
    records.sort_by(|a, b| {
        a.order_key()
            .cmp(&b.order_key())
            .then_with(|| a.id().cmp(b.id()))
    });
}

/// Everything a client shows for one room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomView {
    pub room_id: String,
    pub annotations: CollectionView<Annotation>,
    pub highlights: CollectionView<Highlight>,
    pub messages: CollectionView<ChatMessage>,
    pub bookmarks: CollectionView<Bookmark>,
}

impl RoomView {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            ..Self::default()
        }
    }

    pub fn annotations_on_page(&self, page: u32) -> impl Iterator<Item = &Annotation> {
        self.annotations.iter().filter(move |a| a.page_number == page)
    }

    pub fn highlights_on_page(&self, page: u32) -> impl Iterator<Item = &Highlight> {
        self.highlights.iter().filter(move |h| h.page_number == page)
    }

    /// The user's bookmark on `page`, if any.
    pub fn bookmark_for(&self, user_id: &str, page: u32) -> Option<&Bookmark> {
        self.bookmarks
            .iter()
            .find(|b| b.page_number == page && b.user_id == user_id)
    }

    /// True once every collection has delivered its first snapshot.
    pub fn is_live(&self) -> bool {
        self.annotations.is_live()
            && self.highlights.is_live()
            && self.messages.is_live()
            && self.bookmarks.is_live()
    }

    pub(crate) fn set_all_states(&mut self, state: SubscriptionState) {
        self.annotations.state = state;
        self.highlights.state = state;
        self.messages.state = state;
        self.bookmarks.state = state;
    }
}

/// Where a record type lives inside a [`RoomView`].
pub trait ViewRecord: RoomRecord {
    fn slot(view: &RoomView) -> &CollectionView<Self>;
    fn slot_mut(view: &mut RoomView) -> &mut CollectionView<Self>;
}

impl ViewRecord for Annotation {
    fn slot(view: &RoomView) -> &CollectionView<Self> {
        &view.annotations
    }
    fn slot_mut(view: &mut RoomView) -> &mut CollectionView<Self> {
        &mut view.annotations
    }
}

impl ViewRecord for Highlight {
    fn slot(view: &RoomView) -> &CollectionView<Self> {
        &view.highlights
    }
    fn slot_mut(view: &mut RoomView) -> &mut CollectionView<Self> {
        &mut view.highlights
    }
}

impl ViewRecord for ChatMessage {
    fn slot(view: &RoomView) -> &CollectionView<Self> {
        &view.messages
    }
    fn slot_mut(view: &mut RoomView) -> &mut CollectionView<Self> {
        &mut view.messages
    }
}

impl ViewRecord for Bookmark {
    fn slot(view: &RoomView) -> &CollectionView<Self> {
        &view.bookmarks
    }
    fn slot_mut(view: &mut RoomView) -> &mut CollectionView<Self> {
        &mut view.bookmarks
    }
}
