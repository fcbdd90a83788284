//! Embedding clients for generating vector representations
//!
//! Supports OpenAI-compatible and Ollama embedding APIs, plus a local
//! deterministic hashing embedder for offline use and tests.
//!
//! Author: hephaex@gmail.com

use crate::similarity::normalize;
use async_trait::async_trait;
use ragx_core::{EmbeddingConfig, EmbeddingProvider, RagxError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Embedding Trait
// ============================================================================

/// Trait for embedding generation
///
/// Implementations must return exactly one vector per input, in input
/// order, each of length `dimension()`. The same text and model version
/// must always produce the same vector.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagxError::EmbeddingUnavailable("No embedding returned".to_string()))
    }

    /// Generate embeddings for multiple texts (batch)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Declared output dimension
    fn dimension(&self) -> usize;

    /// Model name, used in logs
    fn model_name(&self) -> &str;
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RagxError::InvalidConfig(format!("Failed to build HTTP client: {e}")))
}

// ============================================================================
// OpenAI Embedding Client
// ============================================================================

/// OpenAI-compatible embedding API client
pub struct OpenAiEmbedding {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
    dimension_override: bool,
}

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingRequest {
    input: Vec<String>,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl OpenAiEmbedding {
    /// Create a new OpenAI embedding client
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        let dimension = match model.as_str() {
            "text-embedding-3-small" => 1536,
            "text-embedding-3-large" => 3072,
            "text-embedding-ada-002" => 1536,
            _ => 1536, // Default
        };

        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model,
            dimension,
            dimension_override: false,
        }
    }

    /// Create from config
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config.openai_api_key.as_ref().ok_or_else(|| {
            RagxError::InvalidConfig("OpenAI API key required".to_string())
        })?;

        let mut client = Self::new(api_key.clone(), config.model.clone());
        client.client = http_client(Duration::from_secs(config.timeout_secs))?;
        if let Some(url) = &config.openai_base_url {
            client = client.with_base_url(url.clone());
        }
        if let Some(dimension) = config.dimension {
            client = client.with_dimension(dimension);
        }
        Ok(client)
    }

    /// Set custom base URL (for compatible APIs)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Request shortened embeddings (text-embedding-3 models)
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self.dimension_override = true;
        self
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = OpenAiEmbeddingRequest {
            input: texts.to_vec(),
            model: self.model.clone(),
            dimensions: self.dimension_override.then_some(self.dimension),
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| RagxError::EmbeddingUnavailable(format!("Embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagxError::EmbeddingUnavailable(format!(
                "OpenAI embedding error ({status}): {error_text}"
            )));
        }

        let result: OpenAiEmbeddingResponse = response.json().await.map_err(|e| {
            RagxError::EmbeddingUnavailable(format!("Failed to parse embedding response: {e}"))
        })?;

        if result.data.len() != texts.len() {
            return Err(RagxError::EmbeddingUnavailable(format!(
                "Expected {} embeddings, received {}",
                texts.len(),
                result.data.len()
            )));
        }

        // Sort by index and extract embeddings
        let mut embeddings = result.data;
        embeddings.sort_by_key(|e| e.index);

        Ok(embeddings.into_iter().map(|e| e.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Ollama Embedding Client
// ============================================================================

/// Ollama embedding API client
pub struct OllamaEmbedding {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedding {
    /// Create a new Ollama embedding client
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        let dimension = match model.as_str() {
            "nomic-embed-text" => 768,
            "mxbai-embed-large" => 1024,
            "all-minilm" => 384,
            _ => 768, // Default for most models
        };

        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model,
            dimension,
        }
    }

    /// Create from config
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let mut client = Self::new(config.ollama_url.clone(), config.model.clone());
        client.client = http_client(Duration::from_secs(config.timeout_secs))?;
        if let Some(dimension) = config.dimension {
            client.dimension = dimension;
        }
        Ok(client)
    }
}

#[async_trait]
impl EmbeddingClient for OllamaEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = OllamaEmbeddingRequest {
            model: &self.model,
            prompt: text,
        };

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                RagxError::EmbeddingUnavailable(format!("Ollama embedding request failed: {e}"))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagxError::EmbeddingUnavailable(format!(
                "Ollama embedding error: {error_text}"
            )));
        }

        let result: OllamaEmbeddingResponse = response.json().await.map_err(|e| {
            RagxError::EmbeddingUnavailable(format!("Failed to parse embedding response: {e}"))
        })?;

        Ok(result.embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // Ollama doesn't have native batch embedding, so we process sequentially
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Hashing Embedding
// ============================================================================

/// Local feature-hashing embedder
///
/// Lower-cased alphanumeric words are hashed (FNV-1a) into `dimension`
/// buckets with a sign bit, then the vector is L2-normalized. Texts that
/// share words score higher under cosine similarity. No network, no model
/// weights, bit-reproducible.
#[derive(Debug, Clone)]
pub struct HashingEmbedding {
    dimension: usize,
}

impl HashingEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return vector;
        }

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let hash = fnv1a(word.to_lowercase().as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingClient for HashingEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "hashing-v1"
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}

// ============================================================================
// Factory function
// ============================================================================

/// Create an embedding client from config
///
/// `default_dimension` sizes the hashing embedder when the config does not
/// set one explicitly.
pub fn create_embedding_client(
    config: &EmbeddingConfig,
    default_dimension: usize,
) -> Result<Arc<dyn EmbeddingClient>> {
    match config.provider {
        EmbeddingProvider::OpenAI => Ok(Arc::new(OpenAiEmbedding::from_config(config)?)),
        EmbeddingProvider::Ollama => Ok(Arc::new(OllamaEmbedding::from_config(config)?)),
        EmbeddingProvider::Hashing => Ok(Arc::new(HashingEmbedding::new(
            config.dimension.unwrap_or(default_dimension),
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine_similarity;

    #[test]
    fn test_openai_dimension() {
        let client = OpenAiEmbedding::new("test-key", "text-embedding-3-small");
        assert_eq!(client.dimension(), 1536);

        let client = OpenAiEmbedding::new("test-key", "text-embedding-3-large");
        assert_eq!(client.dimension(), 3072);

        let client = client.with_dimension(256);
        assert_eq!(client.dimension(), 256);
    }

    #[test]
    fn test_ollama_dimension() {
        let client = OllamaEmbedding::new("http://localhost:11434", "nomic-embed-text");
        assert_eq!(client.dimension(), 768);

        let client = OllamaEmbedding::new("http://localhost:11434", "all-minilm");
        assert_eq!(client.dimension(), 384);
    }

    #[test]
    fn test_ollama_from_config_applies_settings() {
        let config = EmbeddingConfig {
            provider: EmbeddingProvider::Ollama,
            model: "all-minilm".to_string(),
            dimension: Some(512),
            timeout_secs: 5,
            ..Default::default()
        };

        let client = OllamaEmbedding::from_config(&config).unwrap();
        assert_eq!(client.dimension(), 512);
        assert_eq!(client.model_name(), "all-minilm");

        let client = create_embedding_client(&config, 384).unwrap();
        assert_eq!(client.dimension(), 512);
    }

    #[test]
    fn test_openai_requires_api_key() {
        let config = EmbeddingConfig {
            provider: EmbeddingProvider::OpenAI,
            openai_api_key: None,
            ..Default::default()
        };
        assert!(matches!(
            create_embedding_client(&config, 384),
            Err(RagxError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_hashing_is_deterministic_and_ordered() {
        let embedder = HashingEmbedding::new(64);
        let texts = vec![
            "vector search".to_string(),
            "chunk overlap".to_string(),
            "vector search".to_string(),
        ];

        let first = embedder.embed_batch(&texts).await.unwrap();
        let second = embedder.embed_batch(&texts).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_eq!(first[0], first[2]);
        assert_ne!(first[0], first[1]);
        assert!(first.iter().all(|v| v.len() == 64));

        let single = embedder.embed("chunk overlap").await.unwrap();
        assert_eq!(single, first[1]);
    }

    #[tokio::test]
    async fn test_hashing_similarity_tracks_shared_words() {
        let embedder = HashingEmbedding::new(256);
        let query = embedder.embed("rust vector database").await.unwrap();
        let close = embedder.embed("a vector database in Rust").await.unwrap();
        let far = embedder.embed("banana bread recipe").await.unwrap();

        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[tokio::test]
    async fn test_factory_uses_default_dimension() {
        let client = create_embedding_client(&EmbeddingConfig::default(), 128).unwrap();
        assert_eq!(client.dimension(), 128);
        assert_eq!(client.model_name(), "hashing-v1");
    }
}
