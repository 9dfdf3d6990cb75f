//! Parent/chunk record model shared by the chunker, the ingestion pipeline,
//! and the content store.
//!
//! A crawled page becomes one [`PageRecord`] with [`Placement::Document`].
//! When its content exceeds the chunking token budget, the chunker emits the
//! document record followed by [`Placement::Chunk`] records whose URLs carry
//! a `#chunk-{index}` fragment so parents and chunks share one URL namespace
//! without colliding. Making placement a tagged enum keeps the
//! chunk-index/parent relationship a compile-time invariant instead of an
//! optional field that is sometimes meaningful.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

/// Fragment prefix used to synthesize chunk URLs from the parent URL.
pub const CHUNK_FRAGMENT_PREFIX: &str = "chunk-";

/// Where a record sits in the parent/chunk hierarchy.
///
/// Chunks reference their parent by URL (the fragment-stripped form of their
/// own URL); the store resolves that to a row id at write time. Chunks never
/// own other chunks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// A full crawled page. Re-crawling the same URL updates in place.
    Document,
    /// A token-bounded slice of a document, `index` starting at 0 in
    /// left-to-right document order.
    Chunk { index: usize },
}

impl Placement {
    pub fn is_chunk(&self) -> bool {
        matches!(self, Placement::Chunk { .. })
    }

    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            Placement::Document => None,
            Placement::Chunk { index } => Some(*index),
        }
    }
}

/// A document or chunk ready for embedding and persistence.
///
/// Ids are assigned by the store on insert, so records carry none.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    pub title: String,
    pub summary: String,
    pub content: String,
    /// Fixed-length embedding vector, or `None` when generation failed or
    /// has not run yet. Records without embeddings are stored but invisible
    /// to vector search.
    pub embedding: Option<Vec<f32>>,
    /// Open key-value map: source domain, URL path, chunk size, crawl time.
    pub metadata: serde_json::Value,
    pub placement: Placement,
}

impl PageRecord {
    /// Creates a plain document record with empty summary and metadata.
    pub fn document(
        url: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            summary: String::new(),
            content: content.into(),
            embedding: None,
            metadata: serde_json::Value::Object(Default::default()),
            placement: Placement::Document,
        }
    }

    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The URL of this record's parent document.
    ///
    /// For documents this is the record's own URL; for chunks the synthetic
    /// `#chunk-N` fragment is stripped.
    pub fn parent_url(&self) -> &str {
        match self.placement {
            Placement::Document => &self.url,
            Placement::Chunk { .. } => strip_fragment(&self.url),
        }
    }

    /// Synthesizes the URL for chunk `index` of the document at `parent_url`.
    ///
    /// Any fragment already present on the parent URL is dropped first, so a
    /// source URL with a real fragment maps onto the same parent row.
    pub fn chunk_url(parent_url: &str, index: usize) -> String {
        format!(
            "{}#{}{}",
            strip_fragment(parent_url),
            CHUNK_FRAGMENT_PREFIX,
            index
        )
    }
}

/// Drops the fragment portion of a URL, if any.
pub fn strip_fragment(url: &str) -> &str {
    match url.split_once('#') {
        Some((base, _)) => base,
        None => url,
    }
}

/// Builds the standard metadata map for a record: source domain, URL path,
/// token count, and the crawl timestamp.
pub fn page_metadata(url: &str, token_count: usize) -> serde_json::Value {
    json!({
        "source": extract_domain(url),
        "url_path": url_path(url),
        "chunk_size": token_count,
        "crawled_at": Utc::now().to_rfc3339(),
    })
}

/// Extracts the host portion of a URL, or an empty string when unparseable.
pub fn extract_domain(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_default()
}

fn url_path(url: &str) -> String {
    Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_default()
}
