//! Token counting and token-level slicing on the `cl100k_base` vocabulary.
//!
//! Both the chunker (token budgets, hard splits) and the embedding providers
//! (model token ceilings) share one [`Tokenizer`] handle; the underlying BPE
//! table is reference-counted so clones are cheap.

use std::fmt;
use std::sync::Arc;

use tiktoken_rs::{CoreBPE, cl100k_base};

use crate::types::SiftError;

#[derive(Clone)]
pub struct Tokenizer {
    bpe: Arc<CoreBPE>,
}

impl Tokenizer {
    /// Loads the `cl100k_base` encoding used by the `text-embedding-3-*`
    /// model family.
    pub fn cl100k() -> Result<Self, SiftError> {
        let bpe = cl100k_base().map_err(|err| SiftError::Tokenizer(err.to_string()))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    /// Number of tokens in `text`.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_ordinary(text)
    }

    pub fn decode(&self, tokens: &[u32]) -> Result<String, SiftError> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|err| SiftError::Tokenizer(err.to_string()))
    }

    /// Returns `text` cut down to at most `max_tokens` tokens.
    ///
    /// Used to keep embedding inputs under the model ceiling; the cut is at a
    /// token boundary, not a character boundary.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> Result<String, SiftError> {
        let tokens = self.encode(text);
        if tokens.len() <= max_tokens {
            return Ok(text.to_string());
        }
        self.decode(&tokens[..max_tokens])
    }
}

impl fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Tokenizer(cl100k_base)")
    }
}
