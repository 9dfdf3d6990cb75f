//! Storage backends for crawled sites, documents, chunks, and embeddings.
//!
//! This module provides a unified [`ContentStore`] trait so the ingestion
//! pipeline and the hybrid search engine can work against any supported
//! backend without being tied to a specific database.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────┐
//!                    │  ContentStore Trait  │
//!                    │ (sites, pages, search│
//!                    │      primitives)     │
//!                    └──────────┬───────────┘
//!                               │
//!            ┌──────────────────┼──────────────────┐
//!            │                  │                  │
//!            ▼                  ▼                  ▼
//!     ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//!     │   SQLite    │   │  (future)   │   │  (future)   │
//!     │ sqlite-vec  │   │  pgvector   │   │ LanceDB     │
//!     │   + FTS5    │   │             │   │             │
//!     └─────────────┘   └─────────────┘   └─────────────┘
//! ```
//!
//! The store keys rows by `(url, is_chunk, chunk_index)`: re-ingesting a URL
//! updates the existing rows instead of duplicating them. Parent documents
//! and their chunks live in the same table; chunks point at their parent row
//! and carry a `#chunk-{index}` URL fragment.
//!
//! # Supported Backends
//!
//! - [`sqlite::SqliteContentStore`] - SQLite with vector search via
//!   `sqlite-vec` and keyword search via FTS5

pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::PageRecord;
use crate::types::SiftError;

pub use sqlite::SqliteContentStore;

/// A registered crawl source. Pages always belong to exactly one site.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub description: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// Where a stored row sits in the parent/chunk hierarchy.
///
/// Unlike [`crate::model::Placement`], a stored chunk knows its parent's row
/// id: the store resolves the parent URL at write time and orphan chunks are
/// never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredPlacement {
    Document,
    Chunk { index: usize, parent_id: i64 },
}

impl StoredPlacement {
    pub fn is_chunk(&self) -> bool {
        matches!(self, StoredPlacement::Chunk { .. })
    }

    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            StoredPlacement::Document => None,
            StoredPlacement::Chunk { index, .. } => Some(*index),
        }
    }
}

/// A persisted document or chunk, as returned by reads and searches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredPage {
    pub id: i64,
    pub site_id: i64,
    /// Name of the owning site, joined in on reads.
    pub site_name: Option<String>,
    pub url: String,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub placement: StoredPlacement,
    /// Title of the parent document, present only on chunks.
    pub parent_title: Option<String>,
    /// RFC 3339 timestamp of the last write to this row.
    pub updated_at: String,
}

/// One vector search hit: cosine similarity in `[0, 1]`, higher is closer.
#[derive(Clone, Debug)]
pub struct VectorHit {
    pub page: StoredPage,
    pub similarity: f32,
}

/// One keyword search hit. `rank` is strategy-specific but always
/// higher-is-better; callers compare ranks only within one strategy.
#[derive(Clone, Debug)]
pub struct TextHit {
    pub page: StoredPage,
    pub rank: f32,
}

/// Outcome of a chunk batch write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkWriteReport {
    pub written: usize,
    /// Chunks whose parent document was not found. They are skipped and
    /// logged, never persisted.
    pub skipped_orphans: usize,
}

/// Unified interface over content storage.
///
/// Writes are two-phase by convention: callers persist parent documents
/// first, then chunks, so every chunk can resolve its parent row. Each batch
/// method runs in a single transaction.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Registers a site, or returns the existing row when `url` is already
    /// registered.
    async fn add_site(&self, name: &str, url: &str, description: &str)
    -> Result<Site, SiftError>;

    async fn site_by_url(&self, url: &str) -> Result<Option<Site>, SiftError>;

    async fn site_by_id(&self, id: i64) -> Result<Option<Site>, SiftError>;

    async fn all_sites(&self) -> Result<Vec<Site>, SiftError>;

    /// Returns `false` when no site with `id` exists.
    async fn update_site_description(&self, id: i64, description: &str)
    -> Result<bool, SiftError>;

    /// Upserts parent documents, keyed by `(url, is_chunk = false)`.
    /// Returns the number of rows written.
    async fn upsert_documents(
        &self,
        site_id: i64,
        documents: &[PageRecord],
    ) -> Result<usize, SiftError>;

    /// Upserts chunks, keyed by `(url, is_chunk = true, chunk_index)`.
    ///
    /// Each chunk's parent is resolved by its fragment-stripped URL; chunks
    /// without a stored parent are counted in
    /// [`ChunkWriteReport::skipped_orphans`].
    async fn upsert_chunks(
        &self,
        site_id: i64,
        chunks: &[PageRecord],
    ) -> Result<ChunkWriteReport, SiftError>;

    /// Looks up a single row by exact URL (chunk URLs include the fragment).
    async fn page_by_url(&self, url: &str) -> Result<Option<StoredPage>, SiftError>;

    async fn pages_by_site(
        &self,
        site_id: i64,
        limit: Option<usize>,
        include_chunks: bool,
    ) -> Result<Vec<StoredPage>, SiftError>;

    /// Number of rows belonging to a site, with or without chunk rows.
    async fn count_by_site(&self, site_id: i64, include_chunks: bool)
    -> Result<usize, SiftError>;

    /// Nearest rows by cosine similarity, most similar first, keeping only
    /// hits at or above `min_similarity`. Rows without embeddings are
    /// invisible here.
    async fn vector_search(
        &self,
        embedding: &[f32],
        min_similarity: f32,
        limit: usize,
        site_id: Option<i64>,
    ) -> Result<Vec<VectorHit>, SiftError>;

    /// Full-text relevance search over title and content.
    async fn text_search(
        &self,
        query: &str,
        limit: usize,
        site_id: Option<i64>,
    ) -> Result<Vec<TextHit>, SiftError>;

    /// Case-insensitive title substring match, documents ranked before
    /// chunks.
    async fn title_search(
        &self,
        query: &str,
        limit: usize,
        site_id: Option<i64>,
    ) -> Result<Vec<TextHit>, SiftError>;

    /// Case-insensitive substring match over content, the fallback of last
    /// resort.
    async fn substring_search(
        &self,
        query: &str,
        limit: usize,
        site_id: Option<i64>,
    ) -> Result<Vec<TextHit>, SiftError>;

    /// Rows whose URL or site matches a bare domain like `docs.example.com`.
    async fn domain_search(
        &self,
        domain: &str,
        limit: usize,
        site_id: Option<i64>,
    ) -> Result<Vec<TextHit>, SiftError>;
}
