//! Text-analysis capability ("smart annotations").
//!
//! The analyzer itself is external; this module pulls the page text out of
//! the PDF capability and hands it over.

use crate::document::{check_page, PdfRenderer};
use crate::error::{CollabError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const NO_TEXT_MESSAGE: &str = "This page appears to have no text to analyze.";

/// A suggested talking point for a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Exact quote from the page
    pub quote: String,
    pub comment: String,
    /// One or two words, e.g. "Key Insight"
    pub topic: String,
}

#[async_trait]
pub trait TextAnalyzer: Send + Sync {
    async fn analyze(&self, page_text: &str) -> Result<Vec<Suggestion>>;
}

/// Suggestions for one page. Analyzer failures are returned as-is.
pub async fn suggest_for_page<R: PdfRenderer>(
    renderer: &R,
    analyzer: &dyn TextAnalyzer,
    doc: &R::Document,
    page: u32,
) -> Result<Vec<Suggestion>> {
    check_page(doc, page)?;
    let text = renderer.page_text(doc, page).await?;
    if text.trim().is_empty() {
        return Err(CollabError::validation(NO_TEXT_MESSAGE));
    }
    let suggestions = analyzer.analyze(&text).await?;
    log::debug!("{} suggestions for page {page}", suggestions.len());
    Ok(suggestions)
}
