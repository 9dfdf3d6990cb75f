//! Ingestion pipeline: chunk crawled pages, embed the pieces, persist
//! parent-first.
//!
//! ```text
//!   pages ─► Chunker ─► [parent + chunks] ─► embed_batch (per-item isolation)
//!                                              │
//!                           upsert_documents ◄─┴─► upsert_chunks
//!                           (phase 1, one tx)      (phase 2, one tx)
//! ```
//!
//! Chunks are only written after their parent documents, so parent rows are
//! always resolvable; a chunk whose parent is missing is skipped by the
//! store and counted, never fatal.

use tracing::{info, warn};

use crate::chunking::Chunker;
use crate::embeddings::EmbeddingProvider;
use crate::model::PageRecord;
use crate::stores::ContentStore;
use crate::types::SiftError;

/// Counters for one ingestion run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Parent document rows written.
    pub documents: usize,
    /// Chunk rows written.
    pub chunks: usize,
    /// Chunks dropped because their parent was not stored.
    pub skipped_chunks: usize,
    /// Records persisted without an embedding.
    pub failed_embeddings: usize,
}

pub struct IngestionPipeline<E> {
    chunker: Chunker,
    embedder: E,
}

impl<E> IngestionPipeline<E>
where
    E: EmbeddingProvider,
{
    pub fn new(chunker: Chunker, embedder: E) -> Self {
        Self { chunker, embedder }
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// Chunks one page and embeds every resulting record's content.
    ///
    /// Returns the records (embedding failures leave `embedding` as `None`)
    /// and the number of failed embeddings.
    pub async fn chunk_and_embed(&self, page: &PageRecord) -> (Vec<PageRecord>, usize) {
        let mut records = self.chunker.chunk(page);
        let texts: Vec<String> = records
            .iter()
            .map(|record| record.content.clone())
            .collect();
        let vectors = self.embedder.embed_batch(&texts).await;

        let mut failed = 0;
        for (record, vector) in records.iter_mut().zip(vectors) {
            match vector {
                Some(vector) => record.embedding = Some(vector),
                None => {
                    warn!(url = %record.url, "record will be stored without an embedding");
                    failed += 1;
                }
            }
        }
        (records, failed)
    }

    /// Ingests a batch of crawled pages into `store` under `site_id`.
    pub async fn ingest<S>(
        &self,
        store: &S,
        site_id: i64,
        pages: &[PageRecord],
    ) -> Result<IngestReport, SiftError>
    where
        S: ContentStore,
    {
        let mut documents = Vec::new();
        let mut chunks = Vec::new();
        let mut failed_embeddings = 0;

        for page in pages {
            let (records, failed) = self.chunk_and_embed(page).await;
            failed_embeddings += failed;
            for record in records {
                if record.placement.is_chunk() {
                    chunks.push(record);
                } else {
                    documents.push(record);
                }
            }
        }

        let written_documents = store.upsert_documents(site_id, &documents).await?;
        let chunk_report = store.upsert_chunks(site_id, &chunks).await?;

        let report = IngestReport {
            documents: written_documents,
            chunks: chunk_report.written,
            skipped_chunks: chunk_report.skipped_orphans,
            failed_embeddings,
        };
        info!(
            site_id,
            documents = report.documents,
            chunks = report.chunks,
            skipped = report.skipped_chunks,
            without_embedding = report.failed_embeddings,
            "ingestion batch complete"
        );
        Ok(report)
    }
}
