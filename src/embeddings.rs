//! Embedding generation for documents and search queries.
//!
//! Providers implement [`EmbeddingProvider`]; the ingestion pipeline and the
//! search engine only see the trait. Batch embedding isolates failures per
//! item: a failed input yields `None` so the record is still stored, just
//! invisible to vector search until re-ingested.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::tokenizer::Tokenizer;
use crate::types::SiftError;

/// Token ceiling applied to every embedding input. Inputs longer than this
/// are truncated at a token boundary before the API call.
pub const EMBEDDING_TOKEN_CEILING: usize = 8000;

const DEFAULT_MODEL: &str = "text-embedding-3-small";
const DEFAULT_DIMENSIONS: usize = 1536;
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Connection and batching settings for the OpenAI-compatible embedder.
#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub api_key: String,
    pub model: String,
    pub dimensions: usize,
    /// API root, `{base_url}/embeddings` is the endpoint.
    pub base_url: String,
    pub timeout: Duration,
    /// Inputs per API call.
    pub batch_size: usize,
    /// Pause between consecutive batch calls.
    pub batch_pause: Duration,
    pub max_input_tokens: usize,
}

impl EmbeddingConfig {
    /// Reads configuration from the environment (a `.env` file is honored).
    ///
    /// `OPENAI_API_KEY` is required; `OPENAI_EMBEDDING_MODEL` and
    /// `OPENAI_BASE_URL` override the defaults.
    pub fn from_env() -> Result<Self, SiftError> {
        dotenvy::dotenv().ok();
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| SiftError::Config("OPENAI_API_KEY is not set".into()))?;
        let model =
            std::env::var("OPENAI_EMBEDDING_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            api_key,
            model,
            base_url,
            ..Self::with_api_key(String::new())
        })
    }

    /// Defaults with an explicit key, for tests and embedded use.
    pub fn with_api_key(api_key: String) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(8),
            batch_size: 10,
            batch_pause: Duration::from_millis(500),
            max_input_tokens: EMBEDDING_TOKEN_CEILING,
        }
    }
}

/// Anything that can turn text into fixed-length vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider label used in logs.
    fn name(&self) -> &str;

    /// Length of every vector this provider returns.
    fn dimensions(&self) -> usize;

    /// Embeds a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, SiftError>;

    /// Embeds many texts, one `Option` per input in order.
    ///
    /// The default implementation calls [`embed`](Self::embed) per item and
    /// maps failures to `None`; providers with a batch API override this.
    async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            match self.embed(text).await {
                Ok(vector) => out.push(Some(vector)),
                Err(err) => {
                    warn!(provider = self.name(), error = %err, "embedding failed for one input");
                    out.push(None);
                }
            }
        }
        out
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` client.
///
/// Batches go out `batch_size` inputs at a time with a pause in between; a
/// failed batch call is retried item by item so one bad input cannot sink its
/// neighbors. HTTP 429 gets a short backoff before the retry.
pub struct OpenAiEmbedder {
    config: EmbeddingConfig,
    client: reqwest::Client,
    tokenizer: Tokenizer,
}

impl OpenAiEmbedder {
    pub fn new(config: EmbeddingConfig, tokenizer: Tokenizer) -> Result<Self, SiftError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            config,
            client,
            tokenizer,
        })
    }

    pub fn from_env(tokenizer: Tokenizer) -> Result<Self, SiftError> {
        Self::new(EmbeddingConfig::from_env()?, tokenizer)
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, SiftError> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model,
            "input": inputs,
            "dimensions": self.config.dimensions,
        });

        let mut attempts = 0u32;
        let response = loop {
            attempts += 1;
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await?;

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS && attempts < 3 {
                let backoff = Duration::from_millis(500 * u64::from(attempts));
                debug!(attempt = attempts, "rate limited, backing off");
                tokio::time::sleep(backoff).await;
                continue;
            }
            break response;
        };

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(SiftError::Embedding(format!(
                "embeddings API returned {status}: {detail}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|err| SiftError::Embedding(format!("malformed embeddings response: {err}")))?;
        if parsed.data.len() != inputs.len() {
            return Err(SiftError::Embedding(format!(
                "expected {} vectors, got {}",
                inputs.len(),
                parsed.data.len()
            )));
        }
        for item in &parsed.data {
            if item.embedding.len() != self.config.dimensions {
                return Err(SiftError::Embedding(format!(
                    "expected {}-dimensional vectors, got {}",
                    self.config.dimensions,
                    item.embedding.len()
                )));
            }
        }
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }

    fn truncate(&self, text: &str) -> Result<String, SiftError> {
        self.tokenizer.truncate(text, self.config.max_input_tokens)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn name(&self) -> &str {
        &self.config.model
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SiftError> {
        let input = self.truncate(text)?;
        let mut vectors = self.request(&[input]).await?;
        vectors
            .pop()
            .ok_or_else(|| SiftError::Embedding("empty embeddings response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        let mut first = true;

        for batch in texts.chunks(self.config.batch_size.max(1)) {
            if !first {
                tokio::time::sleep(self.config.batch_pause).await;
            }
            first = false;

            let inputs: Vec<String> = match batch
                .iter()
                .map(|text| self.truncate(text))
                .collect::<Result<_, _>>()
            {
                Ok(inputs) => inputs,
                Err(err) => {
                    warn!(error = %err, "truncation failed, embedding batch items individually");
                    for text in batch {
                        out.push(self.embed(text).await.ok());
                    }
                    continue;
                }
            };

            match self.request(&inputs).await {
                Ok(vectors) => out.extend(vectors.into_iter().map(Some)),
                Err(err) => {
                    warn!(error = %err, size = batch.len(), "batch embedding failed, retrying items individually");
                    for input in &inputs {
                        match self.request(std::slice::from_ref(input)).await {
                            Ok(mut vectors) => out.push(vectors.pop()),
                            Err(err) => {
                                warn!(error = %err, "embedding failed for one input");
                                out.push(None);
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

/// Deterministic embedder for tests: vectors are built from character
/// distribution and L2-normalized, so identical texts map to identical
/// vectors and similar texts land near each other under cosine similarity.
#[derive(Clone, Debug)]
pub struct MockEmbeddingProvider {
    dims: usize,
}

impl MockEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for (position, byte) in text.bytes().enumerate() {
            let bucket = (usize::from(byte) + position / 7) % self.dims;
            vector[bucket] += 1.0 + f32::from(byte % 13) / 13.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        } else {
            vector[0] = 1.0;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SiftError> {
        Ok(self.vector_for(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn mock_provider_is_deterministic_and_normalized() {
        let provider = MockEmbeddingProvider::new(32);
        let a = provider.embed("install guide").await.unwrap();
        let b = provider.embed("install guide").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn mock_provider_separates_unrelated_texts() {
        let provider = MockEmbeddingProvider::new(32);
        let guide = provider.embed("installation guide for the tool").await.unwrap();
        let guide_again = provider.embed("installation guide for tools").await.unwrap();
        let recipe = provider.embed("0123456789!@#$%^&*()").await.unwrap();
        assert!(cosine(&guide, &guide_again) > cosine(&guide, &recipe));
    }

    #[tokio::test]
    async fn openai_embedder_parses_vectors() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/embeddings");
            then.status(200).json_body(serde_json::json!({
                "data": [{ "embedding": [0.1, 0.2, 0.3], "index": 0 }]
            }));
        });

        let mut config = EmbeddingConfig::with_api_key("test-key".into());
        config.base_url = format!("{}/v1", server.base_url());
        config.dimensions = 3;
        let embedder = OpenAiEmbedder::new(config, Tokenizer::cl100k().unwrap()).unwrap();

        let vector = embedder.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
        mock.assert();
    }

    #[tokio::test]
    async fn batch_failure_yields_none_per_item() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/embeddings");
            then.status(500).body("boom");
        });

        let mut config = EmbeddingConfig::with_api_key("test-key".into());
        config.base_url = format!("{}/v1", server.base_url());
        config.dimensions = 3;
        config.batch_pause = Duration::from_millis(0);
        let embedder = OpenAiEmbedder::new(config, Tokenizer::cl100k().unwrap()).unwrap();

        let results = embedder
            .embed_batch(&["one".to_string(), "two".to_string()])
            .await;
        assert_eq!(results, vec![None, None]);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/embeddings");
            then.status(200).json_body(serde_json::json!({
                "data": [{ "embedding": [0.1, 0.2], "index": 0 }]
            }));
        });

        let mut config = EmbeddingConfig::with_api_key("test-key".into());
        config.base_url = format!("{}/v1", server.base_url());
        config.dimensions = 3;
        let embedder = OpenAiEmbedder::new(config, Tokenizer::cl100k().unwrap()).unwrap();

        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, SiftError::Embedding(_)));
    }
}
