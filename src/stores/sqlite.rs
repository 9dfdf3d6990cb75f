//! SQLite [`ContentStore`] backed by `sqlite-vec` (vector search) and FTS5
//! (keyword search).
//!
//! One `pages` table holds both documents and chunks, discriminated by
//! `is_chunk`. FTS5 runs as an external-content index kept in sync by
//! triggers; embeddings live in a `vec0` virtual table keyed by page row id.
//! The embedding dimension is pinned in a `meta` table at first open and a
//! mismatch on a later open is a configuration error, not a silent rebuild.

use std::fmt::Write as _;
use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, ffi, params};
use tokio_rusqlite::Connection;
use tracing::warn;

use super::{ChunkWriteReport, ContentStore, Site, StoredPage, StoredPlacement, TextHit, VectorHit};
use crate::model::PageRecord;
use crate::types::SiftError;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS sites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    url TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id INTEGER NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    summary TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    metadata TEXT NOT NULL DEFAULT '{}',
    is_chunk INTEGER NOT NULL DEFAULT 0,
    chunk_index INTEGER,
    parent_id INTEGER REFERENCES pages(id) ON DELETE CASCADE,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_pages_doc_url
    ON pages(url) WHERE is_chunk = 0;
CREATE UNIQUE INDEX IF NOT EXISTS idx_pages_chunk_key
    ON pages(url, chunk_index) WHERE is_chunk = 1;
CREATE INDEX IF NOT EXISTS idx_pages_site ON pages(site_id);
CREATE INDEX IF NOT EXISTS idx_pages_parent ON pages(parent_id);

CREATE VIRTUAL TABLE IF NOT EXISTS pages_fts USING fts5(
    title,
    content,
    content=pages,
    content_rowid=id
);

CREATE TRIGGER IF NOT EXISTS pages_ai AFTER INSERT ON pages BEGIN
    INSERT INTO pages_fts(rowid, title, content)
    VALUES (NEW.id, NEW.title, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS pages_ad AFTER DELETE ON pages BEGIN
    INSERT INTO pages_fts(pages_fts, rowid, title, content)
    VALUES ('delete', OLD.id, OLD.title, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS pages_au AFTER UPDATE ON pages BEGIN
    INSERT INTO pages_fts(pages_fts, rowid, title, content)
    VALUES ('delete', OLD.id, OLD.title, OLD.content);
    INSERT INTO pages_fts(rowid, title, content)
    VALUES (NEW.id, NEW.title, NEW.content);
END;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Column list shared by every page-returning query; [`row_to_page`] depends
/// on this exact order.
const PAGE_COLUMNS: &str = "p.id, p.site_id, s.name, p.url, p.title, p.summary, p.content, \
     p.metadata, p.is_chunk, p.chunk_index, p.parent_id, par.title, p.updated_at";

const PAGE_JOINS: &str = "JOIN sites s ON s.id = p.site_id \
     LEFT JOIN pages par ON par.id = p.parent_id";

#[derive(Clone, Debug)]
pub struct SqliteContentStore {
    conn: Connection,
    dims: usize,
}

impl SqliteContentStore {
    /// Opens (or creates) a store at `path` with the given embedding
    /// dimension.
    ///
    /// Returns [`SiftError::Config`] when the database was created with a
    /// different dimension.
    pub async fn open(path: impl AsRef<Path>, dims: usize) -> Result<Self, SiftError> {
        register_sqlite_vec()?;
        let conn = Connection::open(path).await?;

        conn.call(|conn| {
            conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        let stored: Option<String> = conn
            .call(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM meta WHERE key = 'embedding_dims'",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        if let Some(stored) = stored {
            if stored != dims.to_string() {
                return Err(SiftError::Config(format!(
                    "store was created with embedding_dims = {stored}, requested {dims}"
                )));
            }
        }

        conn.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO meta (key, value) VALUES ('embedding_dims', ?1)",
                params![dims.to_string()],
            )?;
            conn.execute_batch(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS pages_vec USING vec0(
                    page_id INTEGER PRIMARY KEY,
                    embedding float[{dims}] distance_metric=cosine
                );"
            ))?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, dims })
    }

    pub fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Registers `sqlite-vec` as an auto extension so every connection opened
/// afterwards (including the bundled build) sees the `vec0` module.
fn register_sqlite_vec() -> Result<(), SiftError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    INIT.get_or_init(|| unsafe {
        type SqliteExtensionInit = unsafe extern "C" fn(
            *mut ffi::sqlite3,
            *mut *mut c_char,
            *const ffi::sqlite3_api_routines,
        ) -> i32;

        let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
        let init_fn = transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
        let rc = ffi::sqlite3_auto_extension(Some(init_fn));
        if rc != 0 {
            Err(format!(
                "failed to register sqlite-vec extension (code {rc})"
            ))
        } else {
            Ok(())
        }
    })
    .clone()
    .map_err(SiftError::Storage)
}

/// Serializes an embedding as the JSON array form `vec_f32()` accepts.
fn encode_embedding(vector: &[f32]) -> String {
    let mut out = String::with_capacity(vector.len() * 10 + 2);
    out.push('[');
    for (i, value) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{value}");
    }
    out.push(']');
    out
}

fn row_to_page(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredPage> {
    let is_chunk: bool = row.get(8)?;
    let placement = if is_chunk {
        StoredPlacement::Chunk {
            index: row.get::<_, i64>(9)? as usize,
            parent_id: row.get(10)?,
        }
    } else {
        StoredPlacement::Document
    };
    let metadata: String = row.get(7)?;
    Ok(StoredPage {
        id: row.get(0)?,
        site_id: row.get(1)?,
        site_name: row.get(2)?,
        url: row.get(3)?,
        title: row.get(4)?,
        summary: row.get(5)?,
        content: row.get(6)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        placement,
        parent_title: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn row_to_site(row: &rusqlite::Row<'_>) -> rusqlite::Result<Site> {
    Ok(Site {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Inserts or updates one page row keyed by `(url, is_chunk, chunk_index)`,
/// returning its row id.
fn upsert_row(
    tx: &rusqlite::Transaction<'_>,
    site_id: i64,
    page: &PageRecord,
    parent_id: Option<i64>,
) -> Result<i64, tokio_rusqlite::Error> {
    let is_chunk = page.placement.is_chunk();
    let chunk_index = page.placement.chunk_index().map(|index| index as i64);
    let metadata = page.metadata.to_string();
    let now = Utc::now().to_rfc3339();

    let existing: Option<i64> = if let Some(index) = chunk_index {
        tx.query_row(
            "SELECT id FROM pages WHERE url = ?1 AND is_chunk = 1 AND chunk_index = ?2",
            params![page.url, index],
            |row| row.get(0),
        )
        .optional()?
    } else {
        tx.query_row(
            "SELECT id FROM pages WHERE url = ?1 AND is_chunk = 0",
            params![page.url],
            |row| row.get(0),
        )
        .optional()?
    };

    match existing {
        Some(id) => {
            tx.execute(
                "UPDATE pages SET site_id = ?1, title = ?2, summary = ?3, content = ?4, \
                 metadata = ?5, parent_id = ?6, updated_at = ?7 WHERE id = ?8",
                params![
                    site_id,
                    page.title,
                    page.summary,
                    page.content,
                    metadata,
                    parent_id,
                    now,
                    id
                ],
            )?;
            Ok(id)
        }
        None => {
            tx.execute(
                "INSERT INTO pages (site_id, url, title, summary, content, metadata, \
                 is_chunk, chunk_index, parent_id, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    site_id,
                    page.url,
                    page.title,
                    page.summary,
                    page.content,
                    metadata,
                    is_chunk,
                    chunk_index,
                    parent_id,
                    now
                ],
            )?;
            Ok(tx.last_insert_rowid())
        }
    }
}

/// Replaces the embedding row for a page; `None` clears it, hiding the page
/// from vector search.
fn write_embedding(
    tx: &rusqlite::Transaction<'_>,
    page_id: i64,
    embedding: Option<&[f32]>,
) -> Result<(), tokio_rusqlite::Error> {
    tx.execute("DELETE FROM pages_vec WHERE page_id = ?1", params![page_id])?;
    if let Some(vector) = embedding {
        tx.execute(
            "INSERT INTO pages_vec (page_id, embedding) VALUES (?1, vec_f32(?2))",
            params![page_id, encode_embedding(vector)],
        )?;
    }
    Ok(())
}

/// Reduces a free-form query to a safe FTS5 MATCH expression: quoted
/// alphanumeric tokens joined by implicit AND. Returns `None` when nothing
/// searchable remains (punctuation-only queries).
fn sanitize_match_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

/// `%query%` with LIKE metacharacters escaped; pair with `ESCAPE '\'`.
fn like_pattern(query: &str) -> String {
    let escaped = query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[async_trait]
impl ContentStore for SqliteContentStore {
    async fn add_site(
        &self,
        name: &str,
        url: &str,
        description: &str,
    ) -> Result<Site, SiftError> {
        let name = name.to_string();
        let url = url.to_string();
        let description = description.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let now = Utc::now().to_rfc3339();
                conn.execute(
                    "INSERT INTO sites (name, url, description, created_at) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(url) DO UPDATE SET \
                         name = excluded.name, \
                         description = excluded.description",
                    params![name, url, description, now],
                )?;
                let site = conn.query_row(
                    "SELECT id, name, url, description, created_at FROM sites WHERE url = ?1",
                    params![url],
                    row_to_site,
                )?;
                Ok(site)
            })
            .await?)
    }

    async fn site_by_url(&self, url: &str) -> Result<Option<Site>, SiftError> {
        let url = url.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, name, url, description, created_at FROM sites WHERE url = ?1",
                        params![url],
                        row_to_site,
                    )
                    .optional()?)
            })
            .await?)
    }

    async fn site_by_id(&self, id: i64) -> Result<Option<Site>, SiftError> {
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, name, url, description, created_at FROM sites WHERE id = ?1",
                        params![id],
                        row_to_site,
                    )
                    .optional()?)
            })
            .await?)
    }

    async fn all_sites(&self) -> Result<Vec<Site>, SiftError> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, url, description, created_at FROM sites ORDER BY name",
                )?;
                let rows = stmt.query_map([], row_to_site)?;
                let mut sites = Vec::new();
                for site in rows {
                    sites.push(site?);
                }
                Ok(sites)
            })
            .await?)
    }

    async fn update_site_description(
        &self,
        id: i64,
        description: &str,
    ) -> Result<bool, SiftError> {
        let description = description.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE sites SET description = ?1 WHERE id = ?2",
                    params![description, id],
                )?;
                Ok(changed > 0)
            })
            .await?)
    }

    async fn upsert_documents(
        &self,
        site_id: i64,
        documents: &[PageRecord],
    ) -> Result<usize, SiftError> {
        if documents.is_empty() {
            return Ok(0);
        }
        let documents = documents.to_vec();
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0;
                for document in &documents {
                    let id = upsert_row(&tx, site_id, document, None)?;
                    write_embedding(&tx, id, document.embedding.as_deref())?;
                    written += 1;
                }
                tx.commit()?;
                Ok(written)
            })
            .await?)
    }

    async fn upsert_chunks(
        &self,
        site_id: i64,
        chunks: &[PageRecord],
    ) -> Result<ChunkWriteReport, SiftError> {
        if chunks.is_empty() {
            return Ok(ChunkWriteReport::default());
        }
        let chunks = chunks.to_vec();
        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut report = ChunkWriteReport::default();
                for chunk in &chunks {
                    let parent: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM pages WHERE url = ?1 AND is_chunk = 0",
                            params![chunk.parent_url()],
                            |row| row.get(0),
                        )
                        .optional()?;
                    match parent {
                        Some(parent_id) => {
                            let id = upsert_row(&tx, site_id, chunk, Some(parent_id))?;
                            write_embedding(&tx, id, chunk.embedding.as_deref())?;
                            report.written += 1;
                        }
                        None => {
                            warn!(
                                url = %chunk.url,
                                parent = %chunk.parent_url(),
                                "skipping chunk without a stored parent document"
                            );
                            report.skipped_orphans += 1;
                        }
                    }
                }
                tx.commit()?;
                Ok(report)
            })
            .await?)
    }

    async fn page_by_url(&self, url: &str) -> Result<Option<StoredPage>, SiftError> {
        let url = url.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {PAGE_COLUMNS} FROM pages p {PAGE_JOINS} \
                             WHERE p.url = ?1 ORDER BY p.is_chunk ASC LIMIT 1"
                        ),
                        params![url],
                        row_to_page,
                    )
                    .optional()?)
            })
            .await?)
    }

    async fn pages_by_site(
        &self,
        site_id: i64,
        limit: Option<usize>,
        include_chunks: bool,
    ) -> Result<Vec<StoredPage>, SiftError> {
        Ok(self
            .conn
            .call(move |conn| {
                let chunk_filter = if include_chunks {
                    ""
                } else {
                    "AND p.is_chunk = 0"
                };
                let limit_clause = match limit {
                    Some(limit) => format!("LIMIT {limit}"),
                    None => String::new(),
                };
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PAGE_COLUMNS} FROM pages p {PAGE_JOINS} \
                     WHERE p.site_id = ?1 {chunk_filter} \
                     ORDER BY p.url ASC, p.is_chunk ASC, p.chunk_index ASC \
                     {limit_clause}"
                ))?;
                let rows = stmt.query_map(params![site_id], row_to_page)?;
                let mut pages = Vec::new();
                for page in rows {
                    pages.push(page?);
                }
                Ok(pages)
            })
            .await?)
    }

    async fn count_by_site(
        &self,
        site_id: i64,
        include_chunks: bool,
    ) -> Result<usize, SiftError> {
        Ok(self
            .conn
            .call(move |conn| {
                let chunk_filter = if include_chunks {
                    ""
                } else {
                    "AND is_chunk = 0"
                };
                let count: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM pages WHERE site_id = ?1 {chunk_filter}"),
                    params![site_id],
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            })
            .await?)
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        min_similarity: f32,
        limit: usize,
        site_id: Option<i64>,
    ) -> Result<Vec<VectorHit>, SiftError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        if embedding.len() != self.dims {
            return Err(SiftError::Config(format!(
                "query embedding has {} dimensions, store expects {}",
                embedding.len(),
                self.dims
            )));
        }
        let encoded = encode_embedding(embedding);
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PAGE_COLUMNS}, \
                     vec_distance_cosine(v.embedding, vec_f32(?1)) AS distance \
                     FROM pages p {PAGE_JOINS} \
                     JOIN pages_vec v ON v.page_id = p.id \
                     WHERE (?2 IS NULL OR p.site_id = ?2) \
                     ORDER BY distance ASC \
                     LIMIT {limit}"
                ))?;
                let rows = stmt.query_map(params![encoded, site_id], |row| {
                    let page = row_to_page(row)?;
                    let distance: f32 = row.get(13)?;
                    Ok(VectorHit {
                        page,
                        similarity: 1.0 - distance,
                    })
                })?;
                let mut hits = Vec::new();
                for hit in rows {
                    let hit = hit?;
                    if hit.similarity >= min_similarity {
                        hits.push(hit);
                    }
                }
                Ok(hits)
            })
            .await?)
    }

    async fn text_search(
        &self,
        query: &str,
        limit: usize,
        site_id: Option<i64>,
    ) -> Result<Vec<TextHit>, SiftError> {
        let Some(match_expr) = sanitize_match_query(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PAGE_COLUMNS}, -bm25(pages_fts) AS rank \
                     FROM pages_fts \
                     JOIN pages p ON p.id = pages_fts.rowid \
                     {PAGE_JOINS} \
                     WHERE pages_fts MATCH ?1 AND (?2 IS NULL OR p.site_id = ?2) \
                     ORDER BY bm25(pages_fts) ASC, p.is_chunk ASC \
                     LIMIT {limit}"
                ))?;
                let rows = stmt.query_map(params![match_expr, site_id], |row| {
                    let page = row_to_page(row)?;
                    let rank: f32 = row.get(13)?;
                    Ok(TextHit { page, rank })
                })?;
                let mut hits = Vec::new();
                for hit in rows {
                    hits.push(hit?);
                }
                Ok(hits)
            })
            .await?)
    }

    async fn title_search(
        &self,
        query: &str,
        limit: usize,
        site_id: Option<i64>,
    ) -> Result<Vec<TextHit>, SiftError> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let pattern = like_pattern(query.trim());
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PAGE_COLUMNS} FROM pages p {PAGE_JOINS} \
                     WHERE p.title LIKE ?1 ESCAPE '\\' \
                     AND (?2 IS NULL OR p.site_id = ?2) \
                     ORDER BY p.is_chunk ASC, length(p.title) ASC, p.id ASC \
                     LIMIT {limit}"
                ))?;
                let rows = stmt.query_map(params![pattern, site_id], |row| {
                    let page = row_to_page(row)?;
                    Ok(TextHit { page, rank: 1.0 })
                })?;
                let mut hits = Vec::new();
                for hit in rows {
                    hits.push(hit?);
                }
                Ok(hits)
            })
            .await?)
    }

    async fn substring_search(
        &self,
        query: &str,
        limit: usize,
        site_id: Option<i64>,
    ) -> Result<Vec<TextHit>, SiftError> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let pattern = like_pattern(query.trim());
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PAGE_COLUMNS} FROM pages p {PAGE_JOINS} \
                     WHERE (p.content LIKE ?1 ESCAPE '\\' OR p.title LIKE ?1 ESCAPE '\\') \
                     AND (?2 IS NULL OR p.site_id = ?2) \
                     ORDER BY p.is_chunk ASC, p.id ASC \
                     LIMIT {limit}"
                ))?;
                let rows = stmt.query_map(params![pattern, site_id], |row| {
                    let page = row_to_page(row)?;
                    Ok(TextHit { page, rank: 0.5 })
                })?;
                let mut hits = Vec::new();
                for hit in rows {
                    hits.push(hit?);
                }
                Ok(hits)
            })
            .await?)
    }

    async fn domain_search(
        &self,
        domain: &str,
        limit: usize,
        site_id: Option<i64>,
    ) -> Result<Vec<TextHit>, SiftError> {
        if limit == 0 || domain.trim().is_empty() {
            return Ok(Vec::new());
        }
        let pattern = like_pattern(domain.trim());
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PAGE_COLUMNS} FROM pages p {PAGE_JOINS} \
                     WHERE (json_extract(p.metadata, '$.source') LIKE ?1 ESCAPE '\\' \
                            OR s.name LIKE ?1 ESCAPE '\\') \
                     AND (?2 IS NULL OR p.site_id = ?2) \
                     ORDER BY p.is_chunk ASC, p.id ASC \
                     LIMIT {limit}"
                ))?;
                let rows = stmt.query_map(params![pattern, site_id], |row| {
                    let page = row_to_page(row)?;
                    Ok(TextHit { page, rank: 1.0 })
                })?;
                let mut hits = Vec::new();
                for hit in rows {
                    hits.push(hit?);
                }
                Ok(hits)
            })
            .await?)
    }
}
