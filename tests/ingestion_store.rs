//! Ingestion pipeline and store behavior: parent-first writes, upsert
//! semantics, and the site registry.

use async_trait::async_trait;
use tempfile::TempDir;

use sitesift::chunking::{Chunker, ChunkingConfig};
use sitesift::embeddings::{EmbeddingProvider, MockEmbeddingProvider};
use sitesift::ingestion::IngestionPipeline;
use sitesift::model::{PageRecord, Placement};
use sitesift::stores::{ContentStore, SqliteContentStore, StoredPlacement};
use sitesift::tokenizer::Tokenizer;
use sitesift::types::SiftError;

const DIMS: usize = 16;

struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn name(&self) -> &str {
        "failing"
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, SiftError> {
        Err(SiftError::Embedding("provider offline".into()))
    }
}

fn small_chunker() -> Chunker {
    Chunker::with_config(
        Tokenizer::cl100k().unwrap(),
        ChunkingConfig {
            max_tokens: 30,
            overlap_tokens: 6,
            overlap_window_chars: 1000,
        },
    )
}

fn long_page(url: &str, title: &str) -> PageRecord {
    PageRecord::document(
        url,
        title,
        "repeated filler words that push the page well past the budget ".repeat(15),
    )
}

async fn open_store(dir: &TempDir) -> SqliteContentStore {
    SqliteContentStore::open(dir.path().join("ingest.db"), DIMS)
        .await
        .unwrap()
}

#[tokio::test]
async fn ingest_writes_parents_then_chunks() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let site = store
        .add_site("Example", "https://example.com", "")
        .await
        .unwrap();

    let pipeline = IngestionPipeline::new(small_chunker(), MockEmbeddingProvider::new(DIMS));
    let pages = vec![
        long_page("https://example.com/big", "Big Page"),
        PageRecord::document("https://example.com/small", "Small Page", "fits in one piece"),
    ];
    let report = pipeline.ingest(&store, site.id, &pages).await.unwrap();

    assert_eq!(report.documents, 2);
    assert!(report.chunks > 1);
    assert_eq!(report.skipped_chunks, 0);
    assert_eq!(report.failed_embeddings, 0);

    // The parent keeps its full content.
    let parent = store
        .page_by_url("https://example.com/big")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent.placement, StoredPlacement::Document);
    assert!(parent.content.len() > 500);

    // Chunks point at the parent and carry its title through the join.
    let first_chunk = store
        .page_by_url("https://example.com/big#chunk-0")
        .await
        .unwrap()
        .unwrap();
    match first_chunk.placement {
        StoredPlacement::Chunk { index, parent_id } => {
            assert_eq!(index, 0);
            assert_eq!(parent_id, parent.id);
        }
        StoredPlacement::Document => panic!("expected a chunk row"),
    }
    assert_eq!(first_chunk.parent_title.as_deref(), Some("Big Page"));

    // The small page produced no chunk rows.
    let doc_count = store.count_by_site(site.id, false).await.unwrap();
    let total = store.count_by_site(site.id, true).await.unwrap();
    assert_eq!(doc_count, 2);
    assert_eq!(total, 2 + report.chunks);
}

#[tokio::test]
async fn reingesting_updates_in_place() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let site = store
        .add_site("Example", "https://example.com", "")
        .await
        .unwrap();

    let pipeline = IngestionPipeline::new(small_chunker(), MockEmbeddingProvider::new(DIMS));
    let pages = vec![long_page("https://example.com/big", "Big Page")];

    pipeline.ingest(&store, site.id, &pages).await.unwrap();
    let before = store.count_by_site(site.id, true).await.unwrap();

    pipeline.ingest(&store, site.id, &pages).await.unwrap();
    let after = store.count_by_site(site.id, true).await.unwrap();
    assert_eq!(before, after, "re-crawling the same URL must not duplicate rows");
}

#[tokio::test]
async fn failed_embeddings_do_not_lose_content() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let site = store
        .add_site("Example", "https://example.com", "")
        .await
        .unwrap();

    let pipeline = IngestionPipeline::new(small_chunker(), FailingEmbedder);
    let report = pipeline
        .ingest(
            &store,
            site.id,
            &[long_page("https://example.com/big", "Big Page")],
        )
        .await
        .unwrap();

    assert_eq!(report.documents, 1);
    assert!(report.chunks > 1);
    assert_eq!(report.failed_embeddings, 1 + report.chunks);

    // Rows without embeddings are invisible to vector search but still
    // reachable through the keyword path.
    let query = vec![1.0 / (DIMS as f32).sqrt(); DIMS];
    let vector_hits = store.vector_search(&query, 0.0, 10, None).await.unwrap();
    assert!(vector_hits.is_empty());

    let text_hits = store.text_search("filler budget", 10, None).await.unwrap();
    assert!(!text_hits.is_empty());
}

#[tokio::test]
async fn orphan_chunks_are_skipped_and_counted() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let site = store
        .add_site("Example", "https://example.com", "")
        .await
        .unwrap();

    store
        .upsert_documents(
            site.id,
            &[PageRecord::document(
                "https://example.com/present",
                "Present",
                "parent text",
            )],
        )
        .await
        .unwrap();

    let orphan = PageRecord {
        url: PageRecord::chunk_url("https://example.com/absent", 0),
        placement: Placement::Chunk { index: 0 },
        ..PageRecord::document("", "Absent", "orphan text")
    };
    let sibling = PageRecord {
        url: PageRecord::chunk_url("https://example.com/present", 0),
        placement: Placement::Chunk { index: 0 },
        ..PageRecord::document("", "Present", "sibling text")
    };

    let report = store
        .upsert_chunks(site.id, &[orphan, sibling])
        .await
        .unwrap();
    assert_eq!(report.written, 1);
    assert_eq!(report.skipped_orphans, 1);

    // The orphan is absent, the sibling landed.
    assert!(
        store
            .page_by_url("https://example.com/absent#chunk-0")
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .page_by_url("https://example.com/present#chunk-0")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn site_registry_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let a = store
        .add_site("Alpha", "https://alpha.test", "first")
        .await
        .unwrap();
    let b = store
        .add_site("Beta", "https://beta.test", "second")
        .await
        .unwrap();
    assert_ne!(a.id, b.id);

    let by_url = store
        .site_by_url("https://alpha.test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_url.id, a.id);
    assert_eq!(by_url.description, "first");

    assert!(
        store
            .update_site_description(a.id, "first, revised")
            .await
            .unwrap()
    );
    let by_id = store.site_by_id(a.id).await.unwrap().unwrap();
    assert_eq!(by_id.description, "first, revised");

    assert!(!store.update_site_description(9999, "nobody").await.unwrap());

    let all = store.all_sites().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].name, "Alpha");
}

#[tokio::test]
async fn pages_by_site_respects_limit_and_chunk_filter() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let site = store
        .add_site("Example", "https://example.com", "")
        .await
        .unwrap();

    let pipeline = IngestionPipeline::new(small_chunker(), MockEmbeddingProvider::new(DIMS));
    pipeline
        .ingest(
            &store,
            site.id,
            &[
                long_page("https://example.com/big", "Big Page"),
                PageRecord::document("https://example.com/small", "Small Page", "short"),
            ],
        )
        .await
        .unwrap();

    let documents = store.pages_by_site(site.id, None, false).await.unwrap();
    assert_eq!(documents.len(), 2);
    assert!(documents.iter().all(|page| !page.placement.is_chunk()));

    let everything = store.pages_by_site(site.id, None, true).await.unwrap();
    assert!(everything.len() > 2);

    let capped = store.pages_by_site(site.id, Some(1), true).await.unwrap();
    assert_eq!(capped.len(), 1);
}
