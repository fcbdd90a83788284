//! RAGX Engine - Retrieval engine and ingestion orchestration
//!
//! This crate wires the chunker, an embedding client and a vector store
//! into a single retrieval contract:
//! - Document ingestion with per-chunk partial-failure reporting
//! - Top-k similarity queries with deterministic ranking
//! - Document removal
//!
//! On top of it sit an ingestion queue for parallel background ingestion
//! and a retrieval-augmented generation pipeline.
//!
//! Author: hephaex@gmail.com

use ragx_chunker::Chunker;
use ragx_core::{
    AppConfig, Document, EngineConfig, IngestionConfig, IngestionReport, IngestionState,
    RagxError, Result, SearchResult,
};
use ragx_vector::{create_embedding_client, create_vector_store, EmbeddingClient, VectorStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod cache;
pub mod coordinator;
pub mod llm;
pub mod pipeline;
pub mod queue;
pub mod retry;

pub use cache::{CacheStats, CacheStatsReport, CachedEmbedding};
pub use coordinator::{IngestionCoordinator, CANCELLED_REASON};
pub use llm::{create_llm_client, OllamaClient, OpenAiClient};
pub use pipeline::{PromptBuilder, RagAnswer, RagPipeline};
pub use queue::{IngestionQueue, JobHandle};
pub use retry::RetryPolicy;

use coordinator::with_timeout;

// ============================================================================
// Retrieval Engine
// ============================================================================

/// Ingests documents and answers similarity queries against one collection
///
/// The engine is shared across tasks behind an `Arc`; concurrent ingestion
/// and queries need no external locking.
pub struct RetrievalEngine {
    config: EngineConfig,
    embedder: Arc<dyn EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    coordinator: IngestionCoordinator,
    ingestion: IngestionConfig,
}

impl RetrievalEngine {
    /// Create an engine with default ingestion settings
    pub async fn new(
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingClient>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        Self::with_ingestion(config, IngestionConfig::default(), embedder, store).await
    }

    /// Create an engine
    ///
    /// Fails fast on an invalid configuration, on an embedder whose declared
    /// dimension disagrees with `embedding_dimension`, and on an existing
    /// collection with an incompatible schema.
    pub async fn with_ingestion(
        config: EngineConfig,
        ingestion: IngestionConfig,
        embedder: Arc<dyn EmbeddingClient>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        config.validate()?;
        ingestion.validate()?;
        let chunker = Chunker::from_config(&config)?;

        if embedder.dimension() != config.embedding_dimension {
            return Err(RagxError::DimensionMismatch {
                expected: config.embedding_dimension,
                actual: embedder.dimension(),
            });
        }

        store
            .create_collection(
                &config.collection_name,
                config.embedding_dimension,
                config.similarity_metric,
            )
            .await?;

        info!(
            collection = %config.collection_name,
            dimension = config.embedding_dimension,
            metric = %config.similarity_metric,
            model = embedder.model_name(),
            store = store.name(),
            "Retrieval engine ready"
        );

        let coordinator = IngestionCoordinator::new(
            chunker,
            Arc::clone(&embedder),
            Arc::clone(&store),
            config.collection_name.clone(),
            &ingestion,
        );

        Ok(Self {
            config,
            embedder,
            store,
            coordinator,
            ingestion,
        })
    }

    /// Build the embedder and store described by an application config
    pub async fn from_config(app: &AppConfig) -> Result<Self> {
        app.validate()?;

        let embedder = create_embedding_client(&app.embedding, app.engine.embedding_dimension)?;
        let embedder = CachedEmbedding::wrap(embedder, &app.cache);
        let store = create_vector_store(&app.store).await?;

        Self::with_ingestion(app.engine.clone(), app.ingestion.clone(), embedder, store).await
    }

    /// Replace the retry policy used for embed and write calls
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.coordinator = self.coordinator.with_retry_policy(retry);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ingestion_config(&self) -> &IngestionConfig {
        &self.ingestion
    }

    pub fn chunker(&self) -> &Chunker {
        self.coordinator.chunker()
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    fn operation_timeout(&self) -> Duration {
        self.ingestion.operation_timeout()
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    /// Chunk, embed and write one document
    ///
    /// Not atomic: some chunks may be written while others fail, and the
    /// report lists them individually. Re-submitting the same document
    /// under the same configuration overwrites its records in place.
    pub async fn ingest_document(&self, document: &Document) -> Result<IngestionReport> {
        self.coordinator
            .ingest(document, &CancellationToken::new(), None)
            .await
    }

    /// Ingest with cancellation and state notifications
    ///
    /// Cancellation takes effect between batches. Chunks already written
    /// stay in the store; the rest are reported with reason `cancelled`.
    pub async fn ingest_document_with(
        &self,
        document: &Document,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<IngestionState>>,
    ) -> Result<IngestionReport> {
        self.coordinator.ingest(document, cancel, progress).await
    }

    // ------------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------------

    /// Top-k most similar chunks, best first
    ///
    /// Ties in score are broken by the lower record ID.
    pub async fn query(&self, text: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        if text.trim().is_empty() {
            return Err(RagxError::InvalidConfig(
                "query text must not be empty".to_string(),
            ));
        }
        if top_k == 0 || top_k > self.config.max_top_k {
            return Err(RagxError::InvalidConfig(format!(
                "top_k must be between 1 and {}, got {top_k}",
                self.config.max_top_k
            )));
        }

        let started = Instant::now();
        let timeout = self.operation_timeout();

        let query = [text.to_string()];
        let vector = with_timeout(timeout, self.embedder.embed_batch(&query))
            .await?
            .pop()
            .ok_or_else(|| RagxError::EmbeddingUnavailable("No embedding returned".to_string()))?;

        if vector.len() != self.config.embedding_dimension {
            return Err(RagxError::DimensionMismatch {
                expected: self.config.embedding_dimension,
                actual: vector.len(),
            });
        }

        let results = with_timeout(
            timeout,
            self.store.search(
                &self.config.collection_name,
                &vector,
                top_k,
                self.config.similarity_metric,
            ),
        )
        .await?;

        debug!(
            top_k,
            returned = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Query served"
        );
        Ok(results)
    }

    /// Query with the configured default `top_k`
    pub async fn query_default(&self, text: &str) -> Result<Vec<SearchResult>> {
        self.query(text, self.config.top_k_default).await
    }

    /// Query that resolves to `Cancelled` if `cancel` fires first
    ///
    /// Once the store call has been dispatched, cancellation only stops the
    /// caller from waiting for it.
    pub async fn query_with_cancel(
        &self,
        text: &str,
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>> {
        if cancel.is_cancelled() {
            return Err(RagxError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RagxError::Cancelled),
            results = self.query(text, top_k) => results,
        }
    }

    // ------------------------------------------------------------------------
    // Removal and shutdown
    // ------------------------------------------------------------------------

    /// Delete every record of a document, returning the number removed
    pub async fn remove_document(&self, document_id: &str) -> Result<u64> {
        let removed = with_timeout(
            self.operation_timeout(),
            self.store
                .delete_by_document(&self.config.collection_name, document_id),
        )
        .await?;

        info!(document_id, removed, "Document removed");
        Ok(removed)
    }

    /// Release the store; further calls fail with `StoreUnavailable`
    pub async fn shutdown(&self) -> Result<()> {
        self.store.close().await?;
        info!("Retrieval engine shut down");
        Ok(())
    }
}
