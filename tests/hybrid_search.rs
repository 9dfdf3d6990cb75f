//! End-to-end search behavior against a real SQLite store with deterministic
//! mock embeddings.

use async_trait::async_trait;
use tempfile::TempDir;

use sitesift::chunking::{Chunker, ChunkingConfig};
use sitesift::embeddings::{EmbeddingProvider, MockEmbeddingProvider};
use sitesift::ingestion::IngestionPipeline;
use sitesift::model::PageRecord;
use sitesift::search::{HybridSearchEngine, SearchRequest};
use sitesift::stores::{ContentStore, SqliteContentStore};
use sitesift::tokenizer::Tokenizer;
use sitesift::types::SiftError;

const DIMS: usize = 32;

const API_CONTENT: &str = "The frobnicate endpoint accepts JSON payloads.";

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
            max_tokens: 40,
            overlap_tokens: 8,
            overlap_window_chars: 1000,
        },
    )
}

fn install_guide_content() -> String {
    (1..=6)
        .map(|step| {
            format!(
                "# Step {step}\n\nThis part of the installation walks through stage {step} \
                 with detailed instructions and checks.\n\n"
            )
        })
        .collect()
}

/// Ingests the fixture corpus and returns the store and site id.
async fn seeded_store(dir: &TempDir) -> (SqliteContentStore, i64) {
    let store = SqliteContentStore::open(dir.path().join("search.db"), DIMS)
        .await
        .unwrap();
    let site = store
        .add_site("Example Docs", "https://docs.example.com", "product docs")
        .await
        .unwrap();

    let pipeline = IngestionPipeline::new(small_chunker(), MockEmbeddingProvider::new(DIMS));
    let pages = vec![
        PageRecord::document(
            "https://docs.example.com/install",
            "Install Guide",
            install_guide_content(),
        ),
        PageRecord::document("https://docs.example.com/api", "API Reference", API_CONTENT),
        PageRecord::document(
            "https://docs.example.com/faq",
            "FAQ",
            "Answers about the xyzzy widget and billing.",
        ),
    ];
    let report = pipeline.ingest(&store, site.id, &pages).await.unwrap();
    assert_eq!(report.documents, 3);
    assert!(report.chunks > 1, "install guide should have split");
    assert_eq!(report.skipped_chunks, 0);
    assert_eq!(report.failed_embeddings, 0);

    (store, site.id)
}

fn engine(store: &SqliteContentStore) -> HybridSearchEngine<SqliteContentStore, MockEmbeddingProvider> {
    HybridSearchEngine::new(store.clone(), MockEmbeddingProvider::new(DIMS))
}

#[tokio::test]
async fn keyword_only_results_score_at_the_floor() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(&dir).await;
    let engine = engine(&store);

    let results = engine
        .search(&SearchRequest::new("frobnicate").without_embedding())
        .await
        .unwrap();
    assert!(!results.is_empty());
    let top = &results[0];
    assert_eq!(top.page.url, "https://docs.example.com/api");
    assert!(!top.found_in_vector);
    assert!(top.found_in_text);
    assert_eq!(top.similarity, 0.5);
    assert!(top.rank.is_some());
}

#[tokio::test]
async fn keyword_only_ordering_follows_text_rank_not_url() {
    let dir = TempDir::new().unwrap();
    let store = SqliteContentStore::open(dir.path().join("rank.db"), DIMS)
        .await
        .unwrap();
    let site = store.add_site("Rank", "https://rank.test", "").await.unwrap();
    store
        .upsert_documents(
            site.id,
            &[
                PageRecord::document(
                    "https://rank.test/aaa-weak",
                    "Changelog",
                    "One passing mention of quuxify in a long body of unrelated \
                     prose about releases, version numbers, and packaging notes.",
                ),
                PageRecord::document(
                    "https://rank.test/zzz-dense",
                    "Notes",
                    "quuxify setup, quuxify flags, quuxify troubleshooting. \
                     quuxify is the whole subject here.",
                ),
            ],
        )
        .await
        .unwrap();

    let engine = HybridSearchEngine::new(store.clone(), MockEmbeddingProvider::new(DIMS));
    let results = engine
        .search(&SearchRequest::new("quuxify").without_embedding())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    // Both hits carry the keyword floor, so the text rank decides the
    // order; URL-alphabetical would put the weak match first.
    assert_eq!(results[0].similarity, results[1].similarity);
    assert_eq!(results[0].page.url, "https://rank.test/zzz-dense");
    assert!(results[0].rank.unwrap() > results[1].rank.unwrap());
}

#[tokio::test]
async fn agreement_between_branches_boosts_the_hit() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(&dir).await;
    let engine = engine(&store);

    // The query is the stored content verbatim, so the vector branch scores
    // it at similarity 1.0 and the keyword branch matches it too.
    let results = engine
        .search(&SearchRequest::new(API_CONTENT))
        .await
        .unwrap();
    assert!(!results.is_empty());
    let top = &results[0];
    assert_eq!(top.page.url, "https://docs.example.com/api");
    assert!(top.found_in_vector);
    assert!(top.found_in_text);
    assert!((top.similarity - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn nonsense_query_with_high_threshold_returns_nothing() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(&dir).await;
    let engine = engine(&store);

    let results = engine
        .search(&SearchRequest::new("zzzzqqqqxxxxjjjj").with_threshold(0.9))
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn chunk_hits_carry_parent_context() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(&dir).await;
    let engine = engine(&store);

    let results = engine
        .search(&SearchRequest::new("installation").without_embedding())
        .await
        .unwrap();
    let chunk_hit = results
        .iter()
        .find(|result| result.page.placement.is_chunk())
        .expect("some hit should be a chunk");
    let index = chunk_hit.page.placement.chunk_index().unwrap();
    assert_eq!(
        chunk_hit.context.as_deref(),
        Some(format!("From: Install Guide (Part {})", index + 1).as_str())
    );
    assert!(chunk_hit.page.url.contains("#chunk-"));

    let doc_hit = results
        .iter()
        .find(|result| !result.page.placement.is_chunk())
        .expect("the parent document should match too");
    assert_eq!(doc_hit.context, None);
}

#[tokio::test]
async fn punctuation_only_query_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(&dir).await;
    let engine = engine(&store);

    let results = engine
        .search(&SearchRequest::new("!!! ???").without_embedding())
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn empty_query_returns_empty() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(&dir).await;
    let engine = engine(&store);

    let results = engine.search(&SearchRequest::new("   ")).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn substring_fallback_catches_partial_words() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(&dir).await;
    let engine = engine(&store);

    // "xyzz" is not a full token, so FTS finds nothing and the substring
    // fallback has to catch it inside "xyzzy".
    let results = engine
        .search(&SearchRequest::new("xyzz").without_embedding())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].page.url, "https://docs.example.com/faq");
    assert_eq!(results[0].rank, Some(0.5));
}

#[tokio::test]
async fn domain_query_returns_pages_from_that_domain() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(&dir).await;
    let engine = engine(&store);

    let results = engine
        .search(&SearchRequest::new("docs.example.com").without_embedding())
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(
        results
            .iter()
            .all(|result| result.page.url.contains("docs.example.com"))
    );
}

#[tokio::test]
async fn site_filter_restricts_results() {
    let dir = TempDir::new().unwrap();
    let (store, site_id) = seeded_store(&dir).await;

    let other = store
        .add_site("Other", "https://other.test", "")
        .await
        .unwrap();
    let pipeline = IngestionPipeline::new(small_chunker(), MockEmbeddingProvider::new(DIMS));
    pipeline
        .ingest(
            &store,
            other.id,
            &[PageRecord::document(
                "https://other.test/api",
                "Other API",
                "frobnicate lives here as well",
            )],
        )
        .await
        .unwrap();

    let engine = engine(&store);
    let everywhere = engine
        .search(&SearchRequest::new("frobnicate").without_embedding())
        .await
        .unwrap();
    assert_eq!(everywhere.len(), 2);

    let scoped = engine
        .search(
            &SearchRequest::new("frobnicate")
                .without_embedding()
                .for_site(site_id),
        )
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].page.site_id, site_id);
}

#[tokio::test]
async fn broken_embedder_degrades_to_keyword_search() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(&dir).await;
    let engine = HybridSearchEngine::new(store, FailingEmbedder);

    let results = engine
        .search(&SearchRequest::new("frobnicate"))
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(!results[0].found_in_vector);
    assert!(results[0].found_in_text);
}

#[tokio::test]
async fn absent_terms_return_empty_without_error() {
    let dir = TempDir::new().unwrap();
    let (store, _) = seeded_store(&dir).await;
    let engine = engine(&store);

    let results = engine
        .search(&SearchRequest::new("completelyabsenttoken").without_embedding())
        .await
        .unwrap();
    assert!(results.is_empty());
}
