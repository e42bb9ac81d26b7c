//! PDF capability.
//!
//! Parsing and rendering are external. The room stores only the file name;
//! each member selects the file on their own device and it is checked
//! against the room before loading.

use crate::error::{CollabError, Result};
use crate::model::Room;
use async_trait::async_trait;

/// A loaded document.
pub trait PdfDocument: Send + Sync {
    fn page_count(&self) -> u32;
}

/// Loads documents, extracts text and renders pages.
#[async_trait]
pub trait PdfRenderer: Send + Sync {
    type Document: PdfDocument;
    /// Whatever the host draws (bitmap, texture handle, ...)
    type Drawable: Send;

    async fn load_document(&self, bytes: Vec<u8>) -> Result<Self::Document>;

    /// Text of `page` (1-based).
    async fn page_text(&self, doc: &Self::Document, page: u32) -> Result<String>;

    async fn render_page(&self, doc: &Self::Document, page: u32, scale: f32) -> Result<Self::Drawable>;
}

/// A file picked locally by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl SelectedFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// Check that the selected file is the one the room reads.
pub fn verify_room_document(room: &Room, file_name: &str) -> Result<()> {
    if file_name != room.pdf_name {
        return Err(CollabError::Validation(format!(
            "Incorrect file. Please select \"{}\".",
            room.pdf_name
        )));
    }
    Ok(())
}

/// Verify and load the room's document from a locally selected file.
pub async fn open_room_document<R: PdfRenderer>(
    renderer: &R,
    room: &Room,
    file: SelectedFile,
) -> Result<R::Document> {
    verify_room_document(room, &file.name)?;
    let doc = renderer.load_document(file.bytes).await?;
    log::info!(
        "Loaded {} ({} pages) for room {}",
        room.pdf_name,
        doc.page_count(),
        room.id
    );
    Ok(doc)
}

/// Reject page numbers outside `1..=page_count`.
pub fn check_page(doc: &impl PdfDocument, page: u32) -> Result<()> {
    if page == 0 || page > doc.page_count() {
        return Err(CollabError::Validation(format!(
            "Page {page} is out of range (1-{})",
            doc.page_count()
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn room() -> Room {
        Room {
            id: "r1".into(),
            name: "Club".into(),
            pdf_name: "dune.pdf".into(),
            creator_id: "u1".into(),
            members: vec!["u1".into()],
            created_at: 0,
        }
    }

    #[test]
    fn test_verify_room_document() {
        assert!(verify_room_document(&room(), "dune.pdf").is_ok());
        let err = verify_room_document(&room(), "other.pdf").unwrap_err();
        assert_eq!(
            err,
            CollabError::Validation("Incorrect file. Please select \"dune.pdf\".".into())
        );
    }

    #[tokio::test]
    async fn test_open_room_document() {
        let file = SelectedFile::new("dune.pdf", b"one\x0ctwo".to_vec());
        let doc = open_room_document(&TextRenderer, &room(), file).await.unwrap();
        assert_eq!(doc.page_count(), 2);
        assert_eq!(TextRenderer.page_text(&doc, 2).await.unwrap(), "two");
        assert!(TextRenderer.render_page(&doc, 3, 1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_open_wrong_file_does_not_load() {
        let file = SelectedFile::new("x.pdf", vec![0xff]);
        let err = open_room_document(&TextRenderer, &room(), file).await.unwrap_err();
        assert!(matches!(err, CollabError::Validation(_)));
    }
}
