//! Collaboration sync engine.
//!
//! Entering a room opens four independent live queries (annotations,
//! highlights, messages, bookmarks). Each one is pumped by its own task
//! into a shared [`RoomView`] published through a `watch` channel:
//!
//! ```text
//!  store ──Subscription──► pump<Annotation> ──┐
//!  store ──Subscription──► pump<Highlight>  ──┤   apply_snapshot
//!  store ──Subscription──► pump<ChatMessage>──┼──────────────────► watch<RoomView>
//!  store ──Subscription──► pump<Bookmark>   ──┘                        │
//!                                                                      ▼
//!                                                              UI / tests
//! ```
//!
//! Writes are fire-and-forget: the caller gets a [`PendingWrite`] it may
//! await or drop, and the view converges through the next snapshot. A
//! rejected write is published on the [`PermissionErrorBus`] as long as the
//! session is still active.

pub mod view;

use crate::bus::PermissionErrorBus;
use crate::color::{Color, HIGHLIGHT_ALPHA};
use crate::error::{CollabError, Result};
use crate::model::{
    Annotation, AnnotationDraft, Bookmark, ChatMessage, Highlight, HighlightDraft, HighlightRect,
    RoomCollection, UserProfile, SYSTEM_USER_ID, SYSTEM_USER_NAME,
};
use crate::store::{
    path, CollectionPath, DocPath, DocumentStore, Query, StoreError, Subscription, WriteData,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use view::{
    apply_snapshot, decode_snapshot, CollectionView, RoomView, SubscriptionState, ViewRecord,
};

/// Upper bound for page-relative percentages.
const MAX_PERCENT: f64 = 100.0;

/// Author fields snapshotted into every record written by a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Author {
    pub id: String,
    pub name: String,
    pub color: Color,
}

impl From<&UserProfile> for Author {
    fn from(profile: &UserProfile) -> Self {
        Self {
            id: profile.id.clone(),
            name: profile.name.clone(),
            color: profile.color,
        }
    }
}

/// Outcome of [`RoomSession::toggle_bookmark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookmarkToggle {
    Added,
    Removed,
}

/// Handle to an in-flight write. Dropping it does not cancel the write.
#[derive(Debug)]
pub struct PendingWrite {
    handle: JoinHandle<bool>,
}

impl PendingWrite {
    /// Wait for the write; true when the store accepted it.
    pub async fn finished(self) -> bool {
        self.handle.await.unwrap_or(false)
    }
}

/// Opens room sessions for one signed-in user.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn DocumentStore>,
    bus: PermissionErrorBus,
    author: Author,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn DocumentStore>, bus: PermissionErrorBus, author: Author) -> Self {
        Self { store, bus, author }
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    /// Subscribe to the room's four collections.
    pub async fn enter_room(&self, room_id: &str) -> Result<RoomSession> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(CollabError::validation("Room code is required."));
        }

        let room_path = path::room(room_id);
        let mut initial = RoomView::new(room_id);
        initial.set_all_states(SubscriptionState::Subscribing);

        let ctx = WriteContext {
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
            active: Arc::new(AtomicBool::new(true)),
        };
        let view = Arc::new(watch::channel(initial).0);

        let mut tasks = Vec::with_capacity(RoomCollection::ALL.len());
        tasks.push(self.open::<Annotation>(&room_path, &view, &ctx).await);
        tasks.push(self.open::<Highlight>(&room_path, &view, &ctx).await);
        tasks.push(self.open::<ChatMessage>(&room_path, &view, &ctx).await);
        tasks.push(self.open::<Bookmark>(&room_path, &view, &ctx).await);

        log::info!("{} entered room {room_id}", self.author.id);
        Ok(RoomSession {
            room_id: room_id.to_string(),
            room_path,
            author: self.author.clone(),
            view,
            ctx,
            tasks: tasks.into_iter().flatten().collect(),
        })
    }

    async fn open<T: ViewRecord>(
        &self,
        room_path: &DocPath,
        view: &Arc<watch::Sender<RoomView>>,
        ctx: &WriteContext,
    ) -> Option<JoinHandle<()>> {
        let collection = room_path.collection(T::COLLECTION.name());
        match self.store.subscribe(Query::collection(collection.clone())).await {
            Ok(sub) => Some(spawn_pump::<T>(sub, collection, Arc::clone(view), ctx.clone())),
            Err(e) => {
                view.send_modify(|v| T::slot_mut(v).state = SubscriptionState::Error);
                ctx.report_subscription(&collection, e);
                None
            }
        }
    }
}

fn spawn_pump<T: ViewRecord>(
    mut sub: Subscription,
    collection: CollectionPath,
    view: Arc<watch::Sender<RoomView>>,
    ctx: WriteContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = sub.next().await {
            match item {
                Ok(snapshot) => {
                    view.send_if_modified(|v| {
                        if !ctx.is_active() {
                            return false;
                        }
                        let slot = T::slot_mut(v);
                        let next = apply_snapshot(slot, &snapshot);
                        if *slot == next {
                            false
                        } else {
                            *slot = next;
                            true
                        }
                    });
                }
                Err(e) => {
                    mark_error::<T>(&view, &ctx);
                    ctx.report_subscription(&collection, e);
                    return;
                }
            }
        }
        if ctx.is_active() {
            log::warn!("Subscription to {collection} closed by the store");
            mark_error::<T>(&view, &ctx);
        }
    })
}

fn mark_error<T: ViewRecord>(view: &watch::Sender<RoomView>, ctx: &WriteContext) {
    view.send_if_modified(|v| {
        if !ctx.is_active() {
            return false;
        }
        T::slot_mut(v).state = SubscriptionState::Error;
        true
    });
}

/// State shared by a session and its background tasks.
#[derive(Clone)]
struct WriteContext {
    store: Arc<dyn DocumentStore>,
    bus: PermissionErrorBus,
    active: Arc<AtomicBool>,
}

impl WriteContext {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Publish a rejected write, unless the session is gone.
    fn report_write(&self, err: StoreError, payload: Option<Value>) {
        if !self.is_active() {
            log::debug!("Write failed after leaving the room: {err}");
            return;
        }
        let err = self.bus.capture(err, payload);
        if err.permission().is_none() {
            log::error!("Write failed: {err}");
        }
    }

    fn report_subscription(&self, collection: &CollectionPath, err: StoreError) {
        if !self.is_active() {
            return;
        }
        let err = self.bus.capture(err, None);
        if err.permission().is_none() {
            log::error!("Subscription to {collection} failed: {err}");
        }
    }
}

/// A user's presence in one room. Dropping it leaves the room.
pub struct RoomSession {
    room_id: String,
    room_path: DocPath,
    author: Author,
    view: Arc<watch::Sender<RoomView>>,
    ctx: WriteContext,
    tasks: Vec<JoinHandle<()>>,
}

impl RoomSession {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    /// Current view (cloned).
    pub fn view(&self) -> RoomView {
        self.view.borrow().clone()
    }

    /// Receiver notified on every view change.
    pub fn changes(&self) -> watch::Receiver<RoomView> {
        self.view.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.ctx.is_active()
    }

    /// Post a note at a page position. On success a system chat message
    /// announces it.
    pub fn add_annotation(&self, draft: AnnotationDraft) -> Result<PendingWrite> {
        validate_page(draft.page_number)?;
        validate_percent("x", draft.x)?;
        validate_percent("y", draft.y)?;
        let content = non_blank(&draft.content, "Annotation text cannot be empty.")?;

        let record = WriteData::new()
            .set("userId", self.author.id.as_str())
            .set("userName", self.author.name.as_str())
            .set("pageNumber", draft.page_number)
            .set("x", draft.x)
            .set("y", draft.y)
            .set("content", content)
            .set("color", self.author.color.to_css())
            .server_timestamp("timestamp");
        let announcement = format!(
            "{} added an annotation on page {}.",
            self.author.name, draft.page_number
        );

        let ctx = self.ctx.clone();
        let annotations = self.collection(RoomCollection::Annotations);
        let messages = self.collection(RoomCollection::Messages);
        Ok(self.spawn_write(async move {
            let payload = record.to_json();
            if let Err(e) = ctx.store.add(&annotations, record).await {
                ctx.report_write(e, Some(payload));
                return false;
            }
            // Written even after leaving; only reporting stops. Best effort,
            // never rolls back the annotation.
            let notice = system_message(&announcement);
            let payload = notice.to_json();
            if let Err(e) = ctx.store.add(&messages, notice).await {
                ctx.report_write(e, Some(payload));
            }
            true
        }))
    }

    /// Highlight one or more page regions.
    pub fn add_highlight(&self, draft: HighlightDraft) -> Result<PendingWrite> {
        validate_page(draft.page_number)?;
        if draft.rects.is_empty() {
            return Err(CollabError::validation("A highlight needs at least one rectangle."));
        }
        for rect in &draft.rects {
            validate_rect(rect)?;
        }

        let color = draft
            .color
            .unwrap_or_else(|| self.author.color.with_alpha(HIGHLIGHT_ALPHA));
        let rects = serde_json::to_value(&draft.rects).map_err(StoreError::from)?;
        let record = WriteData::new()
            .set("userId", self.author.id.as_str())
            .set("userName", self.author.name.as_str())
            .set("pageNumber", draft.page_number)
            .set("rects", rects)
            .set("color", color.to_css())
            .server_timestamp("timestamp");

        let ctx = self.ctx.clone();
        let highlights = self.collection(RoomCollection::Highlights);
        Ok(self.spawn_write(async move {
            let payload = record.to_json();
            match ctx.store.add(&highlights, record).await {
                Ok(_) => true,
                Err(e) => {
                    ctx.report_write(e, Some(payload));
                    false
                }
            }
        }))
    }

    /// Post a chat message.
    pub fn add_message(&self, text: &str) -> Result<PendingWrite> {
        let text = non_blank(text, "Message cannot be empty.")?;
        let record = WriteData::new()
            .set("userId", self.author.id.as_str())
            .set("userName", self.author.name.as_str())
            .set("message", text)
            .set("type", "text")
            .server_timestamp("timestamp");

        let ctx = self.ctx.clone();
        let messages = self.collection(RoomCollection::Messages);
        Ok(self.spawn_write(async move {
            let payload = record.to_json();
            match ctx.store.add(&messages, record).await {
                Ok(_) => true,
                Err(e) => {
                    ctx.report_write(e, Some(payload));
                    false
                }
            }
        }))
    }

    /// Add the user's bookmark on `page`, or remove it if the current view
    /// already shows one.
    ///
    /// The decision uses the local view, so two toggles issued before a
    /// snapshot refresh can both create.
    pub fn toggle_bookmark(&self, page: u32) -> Result<(BookmarkToggle, PendingWrite)> {
        validate_page(page)?;
        let exists = self
            .view
            .borrow()
            .bookmark_for(&self.author.id, page)
            .is_some();

        let ctx = self.ctx.clone();
        let bookmarks = self.collection(RoomCollection::Bookmarks);

        if exists {
            let query = Query::collection(bookmarks)
                .where_eq("pageNumber", page)
                .where_eq("userId", self.author.id.as_str());
            let pending = self.spawn_write(async move {
                let docs = match ctx.store.query(&query).await {
                    Ok(docs) => docs,
                    Err(e) => {
                        ctx.report_write(e, None);
                        return false;
                    }
                };
                let mut ok = true;
                for doc in docs {
                    let doc_path = query.collection.doc(&doc.id);
                    if let Err(e) = ctx.store.delete(&doc_path).await {
                        ctx.report_write(e, None);
                        ok = false;
                    }
                }
                ok
            });
            Ok((BookmarkToggle::Removed, pending))
        } else {
            let record = WriteData::new()
                .set("userId", self.author.id.as_str())
                .set("userName", self.author.name.as_str())
                .set("pageNumber", page)
                .server_timestamp("timestamp");
            let pending = self.spawn_write(async move {
                let payload = record.to_json();
                match ctx.store.add(&bookmarks, record).await {
                    Ok(_) => true,
                    Err(e) => {
                        ctx.report_write(e, Some(payload));
                        false
                    }
                }
            });
            Ok((BookmarkToggle::Added, pending))
        }
    }

    /// Leave the room, releasing all four subscriptions.
    pub fn leave(self) {}

    fn collection(&self, which: RoomCollection) -> CollectionPath {
        self.room_path.collection(which.name())
    }

    fn spawn_write<F>(&self, write: F) -> PendingWrite
    where
        F: std::future::Future<Output = bool> + Send + 'static,
    {
        PendingWrite {
            handle: tokio::spawn(write),
        }
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.ctx.active.store(false, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.view
            .send_modify(|v| v.set_all_states(SubscriptionState::Unsubscribed));
        log::info!("{} left room {}", self.author.id, self.room_id);
    }
}

fn system_message(text: &str) -> WriteData {
    WriteData::new()
        .set("userId", SYSTEM_USER_ID)
        .set("userName", SYSTEM_USER_NAME)
        .set("message", text)
        .set("type", "system")
        .server_timestamp("timestamp")
}

fn non_blank<'a>(text: &'a str, msg: &str) -> Result<&'a str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(CollabError::validation(msg))
    } else {
        Ok(trimmed)
    }
}

fn validate_page(page: u32) -> Result<()> {
    if page == 0 {
        return Err(CollabError::validation("Page numbers start at 1."));
    }
    Ok(())
}

fn validate_percent(name: &str, value: f64) -> Result<()> {
    if (0.0..=MAX_PERCENT).contains(&value) {
        Ok(())
    } else {
        Err(CollabError::validation(format!(
            "{name} must be between 0 and 100, got {value}"
        )))
    }
}

fn validate_rect(rect: &HighlightRect) -> Result<()> {
    validate_percent("x", rect.x)?;
    validate_percent("y", rect.y)?;
    validate_percent("width", rect.width)?;
    validate_percent("height", rect.height)?;
    if rect.x + rect.width > MAX_PERCENT + f64::EPSILON * 100.0
        || rect.y + rect.height > MAX_PERCENT + f64::EPSILON * 100.0
    {
        return Err(CollabError::validation("Highlight extends past the page."));
    }
    Ok(())
}
