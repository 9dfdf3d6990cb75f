//! Shared error type for the retrieval core.

use thiserror::Error;

/// Errors produced by chunking, embedding, and storage operations.
///
/// Only `Storage` and `Config` errors are expected to reach callers of the
/// search path; everything else is degradable and handled by falling back to
/// a cheaper strategy (see [`crate::search`]).
#[derive(Debug, Error)]
pub enum SiftError {
    /// Embedding generation failed or returned a malformed vector.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Tokenizer initialization or decoding failed.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Database connectivity or query failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration, e.g. an embedding dimension mismatch.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<tokio_rusqlite::Error> for SiftError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        SiftError::Storage(err.to_string())
    }
}
