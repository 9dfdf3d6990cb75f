//! Hybrid search: vector similarity merged with an explicit chain of
//! keyword strategies.
//!
//! ```text
//!   query ──┬─► embed ─► vector_search ──► candidates (similarity)
//!           │              (degrades to keyword-only on failure)
//!           │
//!           └─► keyword chain, first non-empty wins:
//!                 Domain ─► Title ─► FullText ─► Substring
//!
//!   merge by URL:
//!     vector only          keep similarity
//!     keyword only         score floor
//!     found in both        min(similarity + boost, 1.0)
//! ```
//!
//! Failure policy: a failed query embedding or vector query degrades to the
//! keyword chain; a failed keyword strategy degrades to the next one; an
//! empty result set is an empty `Vec`, never an error.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::embeddings::EmbeddingProvider;
use crate::stores::{ContentStore, StoredPage, StoredPlacement, TextHit, VectorHit};
use crate::types::SiftError;

/// Ranking knobs. The defaults are the tuned reference values; they are
/// fields rather than constants so deployments can adjust them.
#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Similarity threshold applied when a request does not carry its own.
    pub default_threshold: f32,
    /// Vector candidates are pre-filtered at `threshold * prefilter_ratio`
    /// so near-misses stay available for the agreement boost.
    pub prefilter_ratio: f32,
    /// Added to the similarity of results found by both branches.
    pub agreement_boost: f32,
    /// Score assigned to keyword-only results.
    pub text_floor: f32,
    /// Each branch fetches `limit * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
    /// Approximate snippet length in characters.
    pub snippet_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.5,
            prefilter_ratio: 0.8,
            agreement_boost: 0.2,
            text_floor: 0.5,
            candidate_multiplier: 2,
            snippet_chars: 200,
        }
    }
}

/// One search invocation.
#[derive(Clone, Debug)]
pub struct SearchRequest {
    pub query: String,
    pub limit: usize,
    /// Overrides [`SearchConfig::default_threshold`] when set.
    pub threshold: Option<f32>,
    pub site_id: Option<i64>,
    /// When false the vector branch is skipped entirely.
    pub use_embedding: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: 10,
            threshold: None,
            site_id: None,
            use_embedding: true,
        }
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn for_site(mut self, site_id: i64) -> Self {
        self.site_id = Some(site_id);
        self
    }

    #[must_use]
    pub fn without_embedding(mut self) -> Self {
        self.use_embedding = false;
        self
    }
}

/// A ranked hit with its provenance.
#[derive(Clone, Debug, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub page: StoredPage,
    /// Final score in `[0, 1]`; results are sorted on this.
    pub similarity: f32,
    /// Keyword rank when the keyword branch matched this row.
    pub rank: Option<f32>,
    pub snippet: String,
    /// `From: {parent title} (Part {n})` for chunk hits.
    pub context: Option<String>,
    pub found_in_vector: bool,
    pub found_in_text: bool,
}

/// The keyword strategies, in the order they are tried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextStrategy {
    /// A dotted host token in the query filters by source domain.
    Domain,
    /// Case-insensitive title substring match.
    Title,
    /// Full-text relevance over title and content.
    FullText,
    /// Relaxed content substring match, last resort.
    Substring,
}

impl TextStrategy {
    pub const CHAIN: [TextStrategy; 4] = [
        TextStrategy::Domain,
        TextStrategy::Title,
        TextStrategy::FullText,
        TextStrategy::Substring,
    ];

    fn label(self) -> &'static str {
        match self {
            TextStrategy::Domain => "domain",
            TextStrategy::Title => "title",
            TextStrategy::FullText => "fulltext",
            TextStrategy::Substring => "substring",
        }
    }
}

pub struct HybridSearchEngine<S, E> {
    store: S,
    embedder: E,
    config: SearchConfig,
}

impl<S, E> HybridSearchEngine<S, E>
where
    S: ContentStore,
    E: EmbeddingProvider,
{
    pub fn new(store: S, embedder: E) -> Self {
        Self::with_config(store, embedder, SearchConfig::default())
    }

    pub fn with_config(store: S, embedder: E, config: SearchConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Runs one hybrid search. Returns an empty list for blank queries and
    /// for queries nothing matches.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>, SiftError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let limit = request.limit.max(1);
        let threshold = request.threshold.unwrap_or(self.config.default_threshold);
        let candidates = limit.saturating_mul(self.config.candidate_multiplier.max(1));

        let vector_hits = if request.use_embedding {
            self.vector_hits(query, threshold, candidates, request.site_id)
                .await
        } else {
            Vec::new()
        };
        let keyword_hits = self.keyword_hits(query, candidates, request.site_id).await;

        // Ties on similarity (every keyword-only hit carries the floor) fall
        // back to the text rank, so the store's relevance ordering survives
        // the merge; URL is the last resort to keep the order stable.
        let mut results = self.merge(vector_hits, keyword_hits);
        results.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| {
                    let a_rank = a.rank.unwrap_or(f32::NEG_INFINITY);
                    let b_rank = b.rank.unwrap_or(f32::NEG_INFINITY);
                    b_rank.total_cmp(&a_rank)
                })
                .then_with(|| a.page.url.cmp(&b.page.url))
        });
        results.truncate(limit);
        Ok(results)
    }

    /// Vector branch; any failure degrades to an empty candidate set.
    async fn vector_hits(
        &self,
        query: &str,
        threshold: f32,
        candidates: usize,
        site_id: Option<i64>,
    ) -> Vec<VectorHit> {
        let vector = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(err) => {
                warn!(error = %err, "query embedding failed, falling back to keyword search");
                return Vec::new();
            }
        };
        let min_similarity = threshold * self.config.prefilter_ratio;
        match self
            .store
            .vector_search(&vector, min_similarity, candidates, site_id)
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, "vector search failed, falling back to keyword search");
                Vec::new()
            }
        }
    }

    /// Keyword branch: the first strategy in [`TextStrategy::CHAIN`] that
    /// returns hits wins; strategy errors are logged and skipped.
    async fn keyword_hits(
        &self,
        query: &str,
        candidates: usize,
        site_id: Option<i64>,
    ) -> Vec<TextHit> {
        for strategy in TextStrategy::CHAIN {
            match self.run_strategy(strategy, query, candidates, site_id).await {
                Ok(hits) if !hits.is_empty() => {
                    debug!(
                        strategy = strategy.label(),
                        hits = hits.len(),
                        "keyword strategy matched"
                    );
                    return hits;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        strategy = strategy.label(),
                        error = %err,
                        "keyword strategy failed, trying the next one"
                    );
                }
            }
        }
        Vec::new()
    }

    async fn run_strategy(
        &self,
        strategy: TextStrategy,
        query: &str,
        limit: usize,
        site_id: Option<i64>,
    ) -> Result<Vec<TextHit>, SiftError> {
        match strategy {
            TextStrategy::Domain => match extract_domain_token(query) {
                Some(domain) => self.store.domain_search(&domain, limit, site_id).await,
                None => Ok(Vec::new()),
            },
            TextStrategy::Title => self.store.title_search(query, limit, site_id).await,
            TextStrategy::FullText => self.store.text_search(query, limit, site_id).await,
            TextStrategy::Substring => self.store.substring_search(query, limit, site_id).await,
        }
    }

    /// Merges both branches keyed by URL and scores each result.
    fn merge(&self, vector_hits: Vec<VectorHit>, keyword_hits: Vec<TextHit>) -> Vec<SearchResult> {
        let mut by_url: HashMap<String, SearchResult> = HashMap::new();

        for hit in vector_hits {
            let result = SearchResult {
                similarity: hit.similarity,
                rank: None,
                snippet: self.snippet(&hit.page),
                context: context_for(&hit.page),
                found_in_vector: true,
                found_in_text: false,
                page: hit.page,
            };
            by_url.insert(result.page.url.clone(), result);
        }

        for hit in keyword_hits {
            match by_url.get_mut(&hit.page.url) {
                Some(existing) => {
                    existing.found_in_text = true;
                    existing.rank = Some(hit.rank);
                    existing.similarity = boost_score(existing.similarity, &self.config);
                }
                None => {
                    let result = SearchResult {
                        similarity: self.config.text_floor,
                        rank: Some(hit.rank),
                        snippet: self.snippet(&hit.page),
                        context: context_for(&hit.page),
                        found_in_vector: false,
                        found_in_text: true,
                        page: hit.page,
                    };
                    by_url.insert(result.page.url.clone(), result);
                }
            }
        }

        by_url.into_values().collect()
    }

    fn snippet(&self, page: &StoredPage) -> String {
        let source = if page.content.trim().is_empty() {
            page.summary.as_str()
        } else {
            page.content.as_str()
        };
        make_snippet(source, self.config.snippet_chars)
    }
}

/// Score for a result found by both branches: boosted similarity, capped at
/// 1.0 and never below the keyword floor.
fn boost_score(similarity: f32, config: &SearchConfig) -> f32 {
    (similarity + config.agreement_boost)
        .min(1.0)
        .max(config.text_floor)
}

/// `From: {parent title} (Part {n})` for chunks, nothing for documents.
fn context_for(page: &StoredPage) -> Option<String> {
    match page.placement {
        StoredPlacement::Chunk { index, .. } => {
            let parent = page
                .parent_title
                .as_deref()
                .filter(|title| !title.trim().is_empty())
                .unwrap_or("Parent Document");
            Some(format!("From: {parent} (Part {})", index + 1))
        }
        StoredPlacement::Document => None,
    }
}

/// First `max_chars` characters of the text, with an ellipsis when cut.
fn make_snippet(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let mut chars = trimmed.char_indices();
    match chars.nth(max_chars) {
        Some((cut, _)) => format!("{}...", trimmed[..cut].trim_end()),
        None => trimmed.to_string(),
    }
}

/// Finds a dotted host-like token (`docs.example.com`) in a query.
fn extract_domain_token(query: &str) -> Option<String> {
    static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"([A-Za-z][-A-Za-z0-9]*\.)+[A-Za-z][-A-Za-z0-9]*").expect("domain regex")
    });
    DOMAIN_RE
        .find(query)
        .map(|matched| matched.as_str().to_string())
}
