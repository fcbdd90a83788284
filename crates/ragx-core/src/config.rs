//! RAGX Configuration Management
//!
//! Handles configuration from environment variables and TOML files with
//! sensible defaults for development. Each component receives its own
//! section explicitly at construction time.

use crate::SimilarityMetric;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Retrieval contract (dimension, metric, chunking, collection)
    pub engine: EngineConfig,

    /// Vector store backend
    pub store: StoreConfig,

    /// Embedding model provider
    pub embedding: EmbeddingConfig,

    /// Generation model provider
    pub llm: LlmConfig,

    /// Bulk ingestion tuning
    pub ingestion: IngestionConfig,

    /// Embedding cache
    pub cache: CacheConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        self.apply_env()?;
        Ok(self)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Engine
        if let Some(dimension) = parse_env("RAGX_DIMENSION")? {
            self.engine.embedding_dimension = dimension;
        }
        if let Some(metric) = parse_env("RAGX_METRIC")? {
            self.engine.similarity_metric = metric;
        }
        if let Some(max_tokens) = parse_env("RAGX_CHUNK_MAX_TOKENS")? {
            self.engine.chunk_max_tokens = max_tokens;
        }
        if let Some(overlap) = parse_env("RAGX_CHUNK_OVERLAP")? {
            self.engine.chunk_overlap = overlap;
        }
        if let Some(top_k) = parse_env("RAGX_TOP_K")? {
            self.engine.top_k_default = top_k;
        }
        if let Some(tokenizer) = parse_env("RAGX_TOKENIZER")? {
            self.engine.tokenizer = tokenizer;
        }
        if let Ok(name) = std::env::var("RAGX_COLLECTION") {
            self.engine.collection_name = name;
        }

        // Vector store
        if let Some(backend) = parse_env("RAGX_STORE")? {
            self.store.backend = backend;
        }
        if let Ok(url) = std::env::var("QDRANT_URL") {
            self.store.qdrant_url = url;
        }
        if let Ok(key) = std::env::var("QDRANT_API_KEY") {
            self.store.qdrant_api_key = Some(key);
        }
        if let Ok(path) = std::env::var("RAGX_SNAPSHOT") {
            self.store.snapshot_path = Some(PathBuf::from(path));
        }

        // Embedding
        if let Some(provider) = parse_env("EMBEDDING_PROVIDER")? {
            self.embedding.provider = provider;
        }
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            self.embedding.ollama_url = url.clone();
            self.llm.ollama_url = url;
        }

        // Always use env for sensitive values
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.embedding.openai_api_key = Some(key.clone());
            self.llm.openai_api_key = Some(key);
        }

        // LLM
        if let Some(provider) = parse_env("LLM_PROVIDER")? {
            self.llm.provider = provider;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            self.llm.model = model;
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = parse_env("LOG_JSON")? {
            self.logging.json_format = json;
        }

        Ok(())
    }

    /// Fail fast on invalid combinations
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.ingestion.validate()?;

        if self.store.backend == StoreBackend::Qdrant && self.store.qdrant_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("store.qdrant_url".to_string()));
        }
        if self.embedding.dimension == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "embedding.dimension".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The retrieval contract shared by ingestion and query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Vector dimension (must match embedding model)
    pub embedding_dimension: usize,

    /// Metric fixed at collection creation
    pub similarity_metric: SimilarityMetric,

    /// Maximum tokens per chunk
    pub chunk_max_tokens: usize,

    /// Tokens shared by consecutive chunks
    pub chunk_overlap: usize,

    /// Number of results when the caller does not ask for a specific count
    pub top_k_default: usize,

    /// Upper bound accepted for top-k
    pub max_top_k: usize,

    /// Collection holding the embedding records
    pub collection_name: String,

    /// How text is split into tokens
    pub tokenizer: TokenizerKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: 384, // all-MiniLM-L6-v2
            similarity_metric: SimilarityMetric::Cosine,
            chunk_max_tokens: 256,
            chunk_overlap: 32,
            top_k_default: 5,
            max_top_k: 100,
            collection_name: "ragx_chunks".to_string(),
            tokenizer: TokenizerKind::Whitespace,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dimension == 0 {
            return Err(invalid("engine.embedding_dimension", self.embedding_dimension));
        }
        if self.chunk_max_tokens == 0 {
            return Err(invalid("engine.chunk_max_tokens", self.chunk_max_tokens));
        }
        if self.chunk_overlap >= self.chunk_max_tokens {
            return Err(invalid("engine.chunk_overlap", self.chunk_overlap));
        }
        if self.max_top_k == 0 {
            return Err(invalid("engine.max_top_k", self.max_top_k));
        }
        if self.top_k_default == 0 || self.top_k_default > self.max_top_k {
            return Err(invalid("engine.top_k_default", self.top_k_default));
        }
        if self.collection_name.trim().is_empty() {
            return Err(ConfigError::MissingRequired(
                "engine.collection_name".to_string(),
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Tokenization used by the chunker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    /// A word plus its trailing whitespace
    #[default]
    Whitespace,
    /// One Unicode scalar value
    Char,
}

impl std::fmt::Display for TokenizerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Whitespace => write!(f, "whitespace"),
            Self::Char => write!(f, "char"),
        }
    }
}

impl FromStr for TokenizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "whitespace" | "word" => Ok(Self::Whitespace),
            "char" | "character" => Ok(Self::Char),
            _ => Err(invalid("RAGX_TOKENIZER", s)),
        }
    }
}

// ============================================================================
// Vector Store
// ============================================================================

/// Vector store backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process exact flat index
    #[default]
    Flat,
    /// Remote Qdrant index
    Qdrant,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flat" | "local" | "memory" => Ok(Self::Flat),
            "qdrant" => Ok(Self::Qdrant),
            _ => Err(invalid("RAGX_STORE", s)),
        }
    }
}

/// Vector store connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Qdrant gRPC URL
    pub qdrant_url: String,

    /// Qdrant API key (cloud deployments)
    pub qdrant_api_key: Option<String>,

    /// Snapshot file for the flat index
    pub snapshot_path: Option<PathBuf>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Flat,
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_api_key: None,
            snapshot_path: None,
            timeout_secs: 30,
        }
    }
}

// ============================================================================
// Embedding
// ============================================================================

/// Supported embedding providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    OpenAI,
    Ollama,
    /// Local deterministic feature hashing
    Hashing,
}

impl FromStr for EmbeddingProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            "hashing" | "local" => Ok(Self::Hashing),
            _ => Err(invalid("EMBEDDING_PROVIDER", s)),
        }
    }
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,

    /// Embedding model name
    pub model: String,

    /// OpenAI API key
    pub openai_api_key: Option<String>,

    /// OpenAI API base URL (for compatible APIs)
    pub openai_base_url: Option<String>,

    /// Ollama server URL
    pub ollama_url: String,

    /// Override of the model's declared output dimension
    pub dimension: Option<usize>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            model: "all-minilm".to_string(),
            openai_api_key: None,
            openai_base_url: None,
            ollama_url: "http://localhost:11434".to_string(),
            dimension: None,
            timeout_secs: 30,
        }
    }
}

// ============================================================================
// LLM
// ============================================================================

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// LLM provider to use
    pub provider: LlmProvider,

    /// OpenAI API key
    pub openai_api_key: Option<String>,

    /// OpenAI API base URL (for compatible APIs)
    pub openai_base_url: Option<String>,

    /// Ollama server URL
    pub ollama_url: String,

    /// Model name to use
    pub model: String,

    /// Maximum tokens for completion
    pub max_tokens: u32,

    /// Temperature for generation
    pub temperature: f32,

    /// Maximum characters of retrieved context in a prompt
    pub max_context_chars: usize,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAI,
            openai_api_key: None,
            openai_base_url: None,
            ollama_url: "http://localhost:11434".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1024,
            temperature: 0.1,
            max_context_chars: 8000,
            timeout_secs: 60,
        }
    }
}

/// Supported LLM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAI,
    Ollama,
}

impl FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            _ => Err(invalid("LLM_PROVIDER", s)),
        }
    }
}

// ============================================================================
// Ingestion
// ============================================================================

/// Bulk ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Chunks per embed/insert batch
    pub batch_size: usize,

    /// Batches of one document in flight at once
    pub max_concurrent_batches: usize,

    /// Timeout for a single embed or insert call, in milliseconds
    pub operation_timeout_ms: u64,

    /// Attempts per transient failure (1 = no retry)
    pub max_attempts: u32,

    /// Initial retry backoff in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum retry backoff in milliseconds
    pub max_backoff_ms: u64,

    /// Documents ingested in parallel by the queue
    pub workers: usize,

    /// Pending jobs accepted by the queue
    pub queue_capacity: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_concurrent_batches: 4,
            operation_timeout_ms: 30_000,
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            workers: 2,
            queue_capacity: 64,
        }
    }
}

impl IngestionConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("ingestion.batch_size", self.batch_size));
        }
        if self.max_concurrent_batches == 0 {
            return Err(invalid(
                "ingestion.max_concurrent_batches",
                self.max_concurrent_batches,
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(invalid(
                "ingestion.operation_timeout_ms",
                self.operation_timeout_ms,
            ));
        }
        if self.max_attempts == 0 {
            return Err(invalid("ingestion.max_attempts", self.max_attempts));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(invalid("ingestion.max_backoff_ms", self.max_backoff_ms));
        }
        if self.workers == 0 || self.queue_capacity == 0 {
            return Err(invalid("ingestion.workers", self.workers));
        }
        Ok(())
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Configuration for the embedding cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Maximum number of cached embeddings
    pub max_capacity: u64,

    /// Time-to-live for entries (in seconds)
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // 10k embeddings @ ~1.5KB each = ~15MB
            max_capacity: 10_000,
            ttl_seconds: 3600,
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.engine.embedding_dimension, 384);
        assert_eq!(config.engine.similarity_metric, SimilarityMetric::Cosine);
        assert_eq!(config.store.backend, StoreBackend::Flat);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let config = EngineConfig {
            chunk_max_tokens: 100,
            chunk_overlap: 100,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "engine.chunk_overlap"
        ));
    }

    #[test]
    fn test_top_k_default_bounded() {
        let config = EngineConfig {
            top_k_default: 500,
            max_top_k: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            top_k_default: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ingestion_backoff_bounds() {
        let config = IngestionConfig {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(IngestionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!(
            "openai".parse::<LlmProvider>().unwrap(),
            LlmProvider::OpenAI
        );
        assert_eq!(
            "ollama".parse::<EmbeddingProvider>().unwrap(),
            EmbeddingProvider::Ollama
        );
        assert_eq!("qdrant".parse::<StoreBackend>().unwrap(), StoreBackend::Qdrant);
        assert_eq!("char".parse::<TokenizerKind>().unwrap(), TokenizerKind::Char);
        assert!("invalid".parse::<LlmProvider>().is_err());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [engine]
            embedding_dimension = 768
            similarity_metric = "dot"
            collection_name = "docs"

            [store]
            backend = "qdrant"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.embedding_dimension, 768);
        assert_eq!(config.engine.similarity_metric, SimilarityMetric::Dot);
        assert_eq!(config.engine.chunk_max_tokens, 256);
        assert_eq!(config.store.backend, StoreBackend::Qdrant);
        assert_eq!(config.store.qdrant_url, "http://localhost:6334");
    }
}
