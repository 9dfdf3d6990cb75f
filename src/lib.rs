//! ```text
//! Crawled pages ──► chunking::Chunker ──► [parent + chunk PageRecords]
//!                                              │
//!                     embeddings::EmbeddingProvider (batched, isolated)
//!                                              │
//! ingestion::IngestionPipeline ──► stores::ContentStore (parent-first)
//!                                              │
//! Query ──► search::HybridSearchEngine ◄───────┘
//!             ├─► vector branch (sqlite-vec cosine)
//!             └─► keyword chain (domain → title → fts → substring)
//! ```
//!
pub mod chunking;
pub mod embeddings;
pub mod ingestion;
pub mod model;
pub mod search;
pub mod stores;
pub mod tokenizer;
pub mod types;

pub use chunking::{Chunker, ChunkingConfig};
pub use embeddings::{EmbeddingConfig, EmbeddingProvider, MockEmbeddingProvider, OpenAiEmbedder};
pub use ingestion::{IngestReport, IngestionPipeline};
pub use model::{PageRecord, Placement};
pub use search::{HybridSearchEngine, SearchConfig, SearchRequest, SearchResult};
pub use stores::{ContentStore, Site, SqliteContentStore, StoredPage, StoredPlacement};
pub use tokenizer::Tokenizer;
pub use types::SiftError;
