//! RAGX Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout RAGX:
//! - Documents, chunks and embedding records
//! - Collection schemas and similarity metrics
//! - Search results and deterministic ranking
//! - Ingestion reports and the per-document state machine
//! - Common error types
//! - Configuration management
//! - Collaborator traits (text generation)

pub mod config;

pub use config::{
    AppConfig, CacheConfig, ConfigError, EmbeddingConfig, EmbeddingProvider, EngineConfig,
    IngestionConfig, LlmConfig, LlmProvider, LoggingConfig, StoreBackend, StoreConfig,
    TokenizerKind,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for RAGX operations
#[derive(Error, Debug)]
pub enum RagxError {
    /// Caller misuse or an invalid configuration. Never retried.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A collection already exists with an incompatible schema.
    #[error("Schema conflict on collection '{collection}': {reason}")]
    SchemaConflict { collection: String, reason: String },

    /// The embedding model call could not be completed.
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Vector length disagrees with the configured dimension.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Transient network or backend failure.
    #[error("Vector store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RagxError {
    /// Whether the orchestration layer may retry the failed unit of work
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable(_) | Self::StoreUnavailable(_) | Self::Timeout(_)
        )
    }

    /// Whether the error must abort the whole call rather than a single chunk
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_) | Self::SchemaConflict { .. } | Self::DimensionMismatch { .. }
        )
    }
}

impl From<ConfigError> for RagxError {
    fn from(err: ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RagxError>;

// ============================================================================
// Documents and Chunks
// ============================================================================

/// Source metadata attached to a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Human-readable title
    pub title: Option<String>,

    /// Original location (file path, URL, ...)
    pub path: Option<String>,

    /// Additional metadata (custom fields)
    pub extra: HashMap<String, serde_json::Value>,

    /// When the document was handed to the engine
    pub created_at: DateTime<Utc>,
}

impl Default for SourceMetadata {
    fn default() -> Self {
        Self {
            title: None,
            path: None,
            extra: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// A document submitted for ingestion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Opaque identifier chosen by the caller
    pub id: String,

    /// Raw text
    pub text: String,

    /// Source metadata
    pub source: SourceMetadata,
}

impl Document {
    /// Create a new document
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            source: SourceMetadata::default(),
        }
    }

    /// Set title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.source.title = Some(title.into());
        self
    }

    /// Set source path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.source.path = Some(path.into());
        self
    }

    /// Add a metadata value
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.source.extra.insert(key.into(), value.into());
        self
    }
}

/// A chunk of document content, the retrievable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Identifier, unique within the document
    pub id: String,

    /// Parent document ID
    pub document_id: String,

    /// Sequence index within the document
    pub index: u32,

    /// Text content (exact slice of the document text)
    pub content: String,

    /// Byte range in the document text
    pub byte_range: Range<usize>,

    /// Token range in the document's token sequence
    pub token_range: Range<usize>,

    /// Fingerprint of the chunking configuration that produced this chunk
    pub fingerprint: String,
}

// ============================================================================
// Embedding Records and Collections
// ============================================================================

/// Maximum stored chunk text length in bytes
pub const MAX_CHUNK_TEXT_BYTES: usize = 65_535;

/// Namespace for deterministic record IDs
const RECORD_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_2a4e_93d7_4b0e_8f5a_1d2c_3b4a_5e6f);

/// Derive the record ID for a chunk of a document.
///
/// Stable across processes, so re-ingesting an unchanged document upserts
/// the same records instead of accumulating duplicates.
pub fn record_id(document_id: &str, chunk_id: &str) -> Uuid {
    Uuid::new_v5(
        &RECORD_NAMESPACE,
        format!("{document_id}/{chunk_id}").as_bytes(),
    )
}

/// The persisted unit in a vector store collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Globally unique primary key
    pub id: Uuid,

    /// Owning document ID
    pub document_id: String,

    /// Chunk ID within the document
    pub chunk_id: String,

    /// Chunk sequence index
    pub chunk_index: u32,

    /// Chunk text (at most `MAX_CHUNK_TEXT_BYTES`)
    pub content: String,

    /// Embedding vector
    pub vector: Vec<f32>,

    /// Chunking configuration fingerprint
    pub fingerprint: String,
}

impl EmbeddingRecord {
    /// Build the record for an embedded chunk
    pub fn from_chunk(chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            id: record_id(&chunk.document_id, &chunk.id),
            document_id: chunk.document_id.clone(),
            chunk_id: chunk.id.clone(),
            chunk_index: chunk.index,
            content: chunk.content.clone(),
            vector,
            fingerprint: chunk.fingerprint.clone(),
        }
    }
}

/// Similarity metric used to rank vectors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    Dot,
    L2,
}

impl std::fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cosine => write!(f, "cosine"),
            Self::Dot => write!(f, "dot"),
            Self::L2 => write!(f, "l2"),
        }
    }
}

impl std::str::FromStr for SimilarityMetric {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "dot" | "dot_product" => Ok(Self::Dot),
            "l2" | "euclid" | "euclidean" => Ok(Self::L2),
            _ => Err(ConfigError::InvalidValue {
                key: "similarity_metric".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Fixed schema of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub dimension: usize,
    pub metric: SimilarityMetric,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>, dimension: usize, metric: SimilarityMetric) -> Self {
        Self {
            name: name.into(),
            dimension,
            metric,
        }
    }

    /// Reject a requested schema that differs from this one
    pub fn ensure_compatible(&self, dimension: usize, metric: SimilarityMetric) -> Result<()> {
        if self.dimension != dimension || self.metric != metric {
            return Err(RagxError::SchemaConflict {
                collection: self.name.clone(),
                reason: format!(
                    "existing schema is (dimension={}, metric={}), requested (dimension={dimension}, metric={metric})",
                    self.dimension, self.metric
                ),
            });
        }
        Ok(())
    }
}

/// Per-record result of a batch insert
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertOutcome {
    /// Records that were written
    pub succeeded: Vec<Uuid>,

    /// Records that were not written, with the reason
    pub failed: Vec<(Uuid, String)>,
}

impl InsertOutcome {
    /// Mark every record of a batch as failed for the same reason
    pub fn all_failed(ids: impl IntoIterator<Item = Uuid>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            succeeded: Vec::new(),
            failed: ids.into_iter().map(|id| (id, reason.clone())).collect(),
        }
    }

    /// True when no record failed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ============================================================================
// Search
// ============================================================================

/// A ranked passage returned by a similarity search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Record primary key
    pub record_id: Uuid,

    /// Owning document ID
    pub document_id: String,

    /// Chunk ID within the document
    pub chunk_id: String,

    /// Chunk text
    pub content: String,

    /// Similarity score (higher is better)
    pub score: f32,
}

/// Order results by descending score, breaking ties by lower record ID
pub fn sort_by_relevance(results: &mut [SearchResult]) {
    results.sort_by(compare_relevance);
}

fn compare_relevance(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.record_id.cmp(&b.record_id))
}

// ============================================================================
// Ingestion Reports
// ============================================================================

/// Lifecycle of a single document's ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionState {
    Pending,
    Chunking,
    Embedding,
    Writing,
    Completed,
    PartiallyFailed,
    Failed,
}

impl IngestionState {
    /// Terminal states are final; there is no implicit retry
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyFailed | Self::Failed)
    }
}

impl std::fmt::Display for IngestionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Writing => "writing",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Outcome of ingesting one document
///
/// A partially failed ingestion is not an error: the failed chunk IDs are
/// enumerated here so the caller can re-submit the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionReport {
    pub document_id: String,

    /// Number of chunks the document was split into
    pub total_chunks: usize,

    /// Chunk IDs that were embedded and written
    pub succeeded: BTreeSet<String>,

    /// Chunk IDs that failed, with the reason
    pub failed: BTreeMap<String, String>,

    /// Terminal state
    pub state: IngestionState,

    /// Records of older chunking configurations removed after this run
    pub records_superseded: u64,

    /// Wall-clock duration in milliseconds
    pub elapsed_ms: u64,
}

impl IngestionReport {
    /// Create an empty report
    pub fn new(document_id: impl Into<String>, total_chunks: usize) -> Self {
        Self {
            document_id: document_id.into(),
            total_chunks,
            succeeded: BTreeSet::new(),
            failed: BTreeMap::new(),
            state: IngestionState::Pending,
            records_superseded: 0,
            elapsed_ms: 0,
        }
    }

    pub fn record_success(&mut self, chunk_id: impl Into<String>) {
        let chunk_id = chunk_id.into();
        self.failed.remove(&chunk_id);
        self.succeeded.insert(chunk_id);
    }

    pub fn record_failure(&mut self, chunk_id: impl Into<String>, reason: impl Into<String>) {
        let chunk_id = chunk_id.into();
        if !self.succeeded.contains(&chunk_id) {
            self.failed.insert(chunk_id, reason.into());
        }
    }

    /// Settle the terminal state from the per-chunk outcomes
    pub fn finalize(&mut self) {
        self.state = if self.failed.is_empty() {
            IngestionState::Completed
        } else {
            IngestionState::PartiallyFailed
        };
    }

    /// IDs of the chunks to retry
    pub fn failed_chunk_ids(&self) -> Vec<&str> {
        self.failed.keys().map(String::as_str).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.state == IngestionState::Completed
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Trait for text-generation clients
///
/// The generation step runs strictly after retrieval has returned.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion for the prompt
    async fn generate(&self, prompt: &str) -> Result<String>;
}

// ============================================================================
// Tests
// ============================================================================
