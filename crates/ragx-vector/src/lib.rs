//! RAGX Vector - Embedding clients and vector database abstraction
//!
//! Provides a narrow, backend-agnostic `VectorStore` trait with two
//! interchangeable implementations:
//! - `FlatIndexStore`: in-process exact brute-force index (reference
//!   implementation, immediate read-after-write)
//! - `QdrantStore`: remote Qdrant index (eventually consistent)

use async_trait::async_trait;
use ragx_core::{
    CollectionSchema, EmbeddingRecord, InsertOutcome, RagxError, Result, SearchResult,
    SimilarityMetric, StoreBackend, StoreConfig, MAX_CHUNK_TEXT_BYTES,
};
use std::sync::Arc;

pub mod embedding;
pub mod flat_store;
pub mod qdrant_store;
pub mod similarity;

pub use embedding::{
    create_embedding_client, EmbeddingClient, HashingEmbedding, OllamaEmbedding, OpenAiEmbedding,
};
pub use flat_store::FlatIndexStore;
pub use qdrant_store::QdrantStore;

/// Trait for vector database operations
///
/// Implementations are shared across concurrent ingestion and query calls
/// and must not require external locking.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create a collection; idempotent when the schema is identical
    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: SimilarityMetric,
    ) -> Result<()>;

    /// Schema of an existing collection
    async fn collection_schema(&self, name: &str) -> Result<Option<CollectionSchema>>;

    /// Upsert records by record ID
    ///
    /// Not atomic across the batch: per-record rejections are reported in
    /// the outcome. `Err(StoreUnavailable)` means nothing in the batch is
    /// known to be written.
    async fn insert(&self, collection: &str, records: &[EmbeddingRecord])
        -> Result<InsertOutcome>;

    /// Up to `top_k` nearest records, best first
    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
        metric: SimilarityMetric,
    ) -> Result<Vec<SearchResult>>;

    /// Delete vectors by document ID, returning the number removed
    async fn delete_by_document(&self, collection: &str, document_id: &str) -> Result<u64>;

    /// Delete a document's records that the latest ingestion did not write
    ///
    /// A record is stale when it was produced under another chunking
    /// fingerprint, or when its chunk index is at or past `chunk_count`.
    async fn delete_stale(
        &self,
        collection: &str,
        document_id: &str,
        fingerprint: &str,
        chunk_count: usize,
    ) -> Result<u64>;

    /// Number of records in the collection
    async fn count(&self, collection: &str) -> Result<u64>;

    /// Release connections and flush state; idempotent
    async fn close(&self) -> Result<()>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Create the configured vector store backend
pub async fn create_vector_store(config: &StoreConfig) -> Result<Arc<dyn VectorStore>> {
    match config.backend {
        StoreBackend::Flat => match &config.snapshot_path {
            Some(path) => Ok(Arc::new(FlatIndexStore::open(path).await?)),
            None => Ok(Arc::new(FlatIndexStore::new())),
        },
        StoreBackend::Qdrant => Ok(Arc::new(QdrantStore::new(config).await?)),
    }
}

// ============================================================================
// Shared validation
// ============================================================================

fn validate_schema_request(dimension: usize) -> Result<()> {
    if dimension == 0 {
        return Err(RagxError::InvalidConfig(
            "collection dimension must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

/// Every record must match the collection dimension; one mismatch aborts the batch
fn check_record_dimensions(schema: &CollectionSchema, records: &[EmbeddingRecord]) -> Result<()> {
    match records.iter().find(|r| r.vector.len() != schema.dimension) {
        Some(record) => Err(RagxError::DimensionMismatch {
            expected: schema.dimension,
            actual: record.vector.len(),
        }),
        None => Ok(()),
    }
}

/// Reason a single record cannot be stored, if any
fn reject_reason(record: &EmbeddingRecord) -> Option<String> {
    if record.vector.iter().any(|x| !x.is_finite()) {
        return Some("vector contains non-finite values".to_string());
    }
    if record.content.len() > MAX_CHUNK_TEXT_BYTES {
        return Some(format!(
            "chunk text is {} bytes, limit is {MAX_CHUNK_TEXT_BYTES}",
            record.content.len()
        ));
    }
    None
}

fn validate_search(
    schema: &CollectionSchema,
    query_vector: &[f32],
    top_k: usize,
    metric: SimilarityMetric,
) -> Result<()> {
    if top_k == 0 {
        return Err(RagxError::InvalidConfig(
            "top_k must be greater than 0".to_string(),
        ));
    }
    if query_vector.len() != schema.dimension {
        return Err(RagxError::InvalidConfig(format!(
            "query vector has length {}, collection '{}' expects {}",
            query_vector.len(),
            schema.name,
            schema.dimension
        )));
    }
    if query_vector.iter().any(|x| !x.is_finite()) {
        return Err(RagxError::InvalidConfig(
            "query vector contains non-finite values".to_string(),
        ));
    }
    if metric != schema.metric {
        return Err(RagxError::InvalidConfig(format!(
            "metric {metric} does not match collection '{}' metric {}",
            schema.name, schema.metric
        )));
    }
    Ok(())
}

fn unknown_collection(name: &str) -> RagxError {
    RagxError::InvalidConfig(format!("collection '{name}' does not exist"))
}
