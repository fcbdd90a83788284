//! Ingestion coordinator
//!
//! Drives one document through chunk → embed → write. Chunks are grouped
//! into batches which run concurrently; results are joined back by chunk ID.
//! Transient failures are retried and, if they persist, isolated to the
//! chunks they affect. Fatal errors abort the whole ingestion.

use crate::retry::RetryPolicy;
use futures::stream::{self, StreamExt};
use ragx_chunker::Chunker;
use ragx_core::{
    Chunk, Document, EmbeddingRecord, IngestionConfig, IngestionReport, IngestionState, RagxError,
    Result, MAX_CHUNK_TEXT_BYTES,
};
use ragx_vector::{EmbeddingClient, VectorStore};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Failure reason recorded for chunks never submitted after cancellation
pub const CANCELLED_REASON: &str = "cancelled";

/// Per-batch result, keyed by chunk ID
#[derive(Debug, Default)]
struct BatchOutcome {
    succeeded: Vec<String>,
    failed: Vec<(String, String)>,
}

impl BatchOutcome {
    fn fail_all<'a>(chunks: impl IntoIterator<Item = &'a Chunk>, reason: &str) -> Self {
        Self {
            succeeded: Vec::new(),
            failed: chunks
                .into_iter()
                .map(|c| (c.id.clone(), reason.to_string()))
                .collect(),
        }
    }
}

/// Orchestrates chunking, embedding and writing for a single document
pub struct IngestionCoordinator {
    chunker: Chunker,
    embedder: Arc<dyn EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    collection: String,
    batch_size: usize,
    max_concurrent_batches: usize,
    operation_timeout: Duration,
    retry: RetryPolicy,
}

impl IngestionCoordinator {
    pub fn new(
        chunker: Chunker,
        embedder: Arc<dyn EmbeddingClient>,
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        config: &IngestionConfig,
    ) -> Self {
        Self {
            chunker,
            embedder,
            store,
            collection: collection.into(),
            batch_size: config.batch_size.max(1),
            max_concurrent_batches: config.max_concurrent_batches.max(1),
            operation_timeout: config.operation_timeout(),
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// Ingest one document
    ///
    /// Returns a report for `Completed` and `PartiallyFailed` outcomes. An
    /// `Err` means the ingestion failed as a whole: the document could not
    /// be chunked or a fatal error aborted it. State transitions are
    /// published on `progress` when given.
    pub async fn ingest(
        &self,
        document: &Document,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<IngestionState>>,
    ) -> Result<IngestionReport> {
        let started = Instant::now();
        advance(progress, IngestionState::Chunking);

        let result = self.run(document, cancel, progress, started).await;
        match &result {
            Ok(report) => {
                advance(progress, report.state);
                info!(
                    document_id = %report.document_id,
                    state = %report.state,
                    chunks = report.total_chunks,
                    failed = report.failed.len(),
                    superseded = report.records_superseded,
                    elapsed_ms = report.elapsed_ms,
                    "Ingestion finished"
                );
            }
            Err(e) => {
                advance(progress, IngestionState::Failed);
                warn!(document_id = %document.id, "Ingestion failed: {e}");
            }
        }
        result
    }

    async fn run(
        &self,
        document: &Document,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<IngestionState>>,
        started: Instant,
    ) -> Result<IngestionReport> {
        if document.id.trim().is_empty() {
            return Err(RagxError::InvalidConfig(
                "document id must not be empty".to_string(),
            ));
        }

        let chunks = self.chunker.chunk(&document.id, &document.text);
        let mut report = IngestionReport::new(&document.id, chunks.len());
        debug!(
            document_id = %document.id,
            chunks = chunks.len(),
            fingerprint = self.chunker.fingerprint(),
            "Document chunked"
        );

        advance(progress, IngestionState::Embedding);

        let pending: Vec<_> = chunks
            .chunks(self.batch_size)
            .enumerate()
            .map(|(index, batch)| self.run_batch(index, batch, cancel, progress))
            .collect();
        let mut batches = stream::iter(pending).buffer_unordered(self.max_concurrent_batches);

        while let Some(outcome) = batches.next().await {
            let outcome = outcome?;
            for chunk_id in outcome.succeeded {
                report.record_success(chunk_id);
            }
            for (chunk_id, reason) in outcome.failed {
                report.record_failure(chunk_id, reason);
            }
        }

        report.finalize();

        if report.is_complete() {
            report.records_superseded = self
                .supersede_stale(&document.id, report.total_chunks)
                .await;
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Process one batch unless ingestion was cancelled before it started
    async fn run_batch(
        &self,
        index: usize,
        batch: &[Chunk],
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<IngestionState>>,
    ) -> Result<BatchOutcome> {
        if cancel.is_cancelled() {
            debug!(batch = index, "Skipping batch after cancellation");
            return Ok(BatchOutcome::fail_all(batch, CANCELLED_REASON));
        }
        self.process_batch(index, batch, progress).await
    }

    async fn process_batch(
        &self,
        index: usize,
        batch: &[Chunk],
        progress: Option<&watch::Sender<IngestionState>>,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        let (sized, oversized): (Vec<&Chunk>, Vec<&Chunk>) = batch
            .iter()
            .partition(|c| c.content.len() <= MAX_CHUNK_TEXT_BYTES);
        for chunk in oversized {
            outcome.failed.push((
                chunk.id.clone(),
                format!(
                    "chunk text is {} bytes, limit is {MAX_CHUNK_TEXT_BYTES}",
                    chunk.content.len()
                ),
            ));
        }
        if sized.is_empty() {
            return Ok(outcome);
        }

        let records = self.embed_chunks(index, &sized, &mut outcome).await?;
        if records.is_empty() {
            return Ok(outcome);
        }

        advance(progress, IngestionState::Writing);
        self.write_records(index, &records, &mut outcome).await?;

        debug!(
            batch = index,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Batch processed"
        );
        Ok(outcome)
    }

    /// Embed a batch, falling back to one call per chunk if the batch fails
    async fn embed_chunks(
        &self,
        index: usize,
        chunks: &[&Chunk],
        outcome: &mut BatchOutcome,
    ) -> Result<Vec<EmbeddingRecord>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();

        let batch_error = match self.embed_texts(&texts).await {
            Ok(vectors) => {
                return Ok(chunks
                    .iter()
                    .zip(vectors)
                    .map(|(chunk, vector)| EmbeddingRecord::from_chunk(chunk, vector))
                    .collect())
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => e,
        };

        if chunks.len() == 1 {
            outcome
                .failed
                .push((chunks[0].id.clone(), batch_error.to_string()));
            return Ok(Vec::new());
        }

        warn!(
            batch = index,
            "Batch embedding failed ({batch_error}), embedding chunks individually"
        );

        let mut records = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match self.embed_texts(std::slice::from_ref(&chunk.content)).await {
                Ok(mut vectors) => match vectors.pop() {
                    Some(vector) => records.push(EmbeddingRecord::from_chunk(chunk, vector)),
                    None => outcome
                        .failed
                        .push((chunk.id.clone(), "no embedding returned".to_string())),
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(chunk_id = %chunk.id, "Chunk embedding failed: {e}");
                    outcome.failed.push((chunk.id.clone(), e.to_string()));
                }
            }
        }
        Ok(records)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self
            .retry
            .execute("embed", || {
                with_timeout(self.operation_timeout, self.embedder.embed_batch(texts))
            })
            .await?;

        if vectors.len() != texts.len() {
            return Err(RagxError::EmbeddingUnavailable(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    async fn write_records(
        &self,
        index: usize,
        records: &[EmbeddingRecord],
        outcome: &mut BatchOutcome,
    ) -> Result<()> {
        let chunk_ids: HashMap<Uuid, &str> = records
            .iter()
            .map(|r| (r.id, r.chunk_id.as_str()))
            .collect();

        let written = self
            .retry
            .execute("insert", || {
                with_timeout(
                    self.operation_timeout,
                    self.store.insert(&self.collection, records),
                )
            })
            .await;

        let insert = match written {
            Ok(insert) => insert,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(batch = index, "Batch write failed: {e}");
                let reason = e.to_string();
                outcome.failed.extend(
                    records
                        .iter()
                        .map(|r| (r.chunk_id.clone(), reason.clone())),
                );
                return Ok(());
            }
        };

        let mut acknowledged = 0;
        for id in &insert.succeeded {
            if let Some(chunk_id) = chunk_ids.get(id) {
                outcome.succeeded.push(chunk_id.to_string());
                acknowledged += 1;
            }
        }
        for (id, reason) in &insert.failed {
            if let Some(chunk_id) = chunk_ids.get(id) {
                warn!(chunk_id = %chunk_id, "Record rejected by store: {reason}");
                outcome.failed.push((chunk_id.to_string(), reason.clone()));
                acknowledged += 1;
            }
        }
        if acknowledged < records.len() {
            let reported: std::collections::HashSet<&Uuid> = insert
                .succeeded
                .iter()
                .chain(insert.failed.iter().map(|(id, _)| id))
                .collect();
            for record in records.iter().filter(|r| !reported.contains(&r.id)) {
                outcome.failed.push((
                    record.chunk_id.clone(),
                    "write not acknowledged by store".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Remove the document's records from other chunking configurations and
    /// trailing chunks left by a longer previous version
    async fn supersede_stale(&self, document_id: &str, chunk_count: usize) -> u64 {
        let fingerprint = self.chunker.fingerprint();
        let removed = self
            .retry
            .execute("delete stale", || {
                with_timeout(
                    self.operation_timeout,
                    self.store
                        .delete_stale(&self.collection, document_id, fingerprint, chunk_count),
                )
            })
            .await;

        match removed {
            Ok(count) => {
                if count > 0 {
                    info!(document_id, count, "Superseded stale records");
                }
                count
            }
            Err(e) => {
                warn!(document_id, "Failed to remove stale records: {e}");
                0
            }
        }
    }
}

/// Bound a single unit of work by `limit`
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| RagxError::Timeout(limit))?
}

/// Publish `state` if it moves the ingestion forward
fn advance(progress: Option<&watch::Sender<IngestionState>>, state: IngestionState) {
    if let Some(tx) = progress {
        tx.send_if_modified(|current| {
            if current.is_terminal() || (state as u8) <= (*current as u8) {
                return false;
            }
            *current = state;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragx_core::{SimilarityMetric, TokenizerKind};
    use ragx_vector::{FlatIndexStore, HashingEmbedding};

    const DIM: usize = 32;

    async fn coordinator(batch_size: usize) -> (IngestionCoordinator, Arc<FlatIndexStore>) {
        let store = Arc::new(FlatIndexStore::new());
        store
            .create_collection("test", DIM, SimilarityMetric::Cosine)
            .await
            .unwrap();

        let config = IngestionConfig {
            batch_size,
            max_concurrent_batches: 2,
            ..IngestionConfig::default()
        };
        let coordinator = IngestionCoordinator::new(
            Chunker::new(4, 1, TokenizerKind::Whitespace).unwrap(),
            Arc::new(HashingEmbedding::new(DIM)),
            store.clone(),
            "test",
            &config,
        );
        (coordinator, store)
    }

    #[tokio::test]
    async fn test_ingest_reports_all_chunks() {
        let (coordinator, store) = coordinator(2).await;
        let doc = Document::new("doc-1", "one two three four five six seven eight nine ten");
        let (tx, rx) = watch::channel(IngestionState::Pending);

        let report = coordinator
            .ingest(&doc, &CancellationToken::new(), Some(&tx))
            .await
            .unwrap();

        assert_eq!(report.total_chunks, 3);
        assert_eq!(report.succeeded.len(), 3);
        assert!(report.failed.is_empty());
        assert_eq!(report.state, IngestionState::Completed);
        assert_eq!(*rx.borrow(), IngestionState::Completed);
        assert_eq!(store.count("test").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_empty_document_completes_without_chunks() {
        let (coordinator, store) = coordinator(2).await;
        let report = coordinator
            .ingest(&Document::new("empty", ""), &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(report.total_chunks, 0);
        assert!(report.is_complete());
        assert_eq!(store.count("test").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blank_document_id_fails() {
        let (coordinator, _) = coordinator(2).await;
        let (tx, rx) = watch::channel(IngestionState::Pending);

        let result = coordinator
            .ingest(&Document::new(" ", "text"), &CancellationToken::new(), Some(&tx))
            .await;

        assert!(matches!(result, Err(RagxError::InvalidConfig(_))));
        assert_eq!(*rx.borrow(), IngestionState::Failed);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let (coordinator, store) = coordinator(1).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = coordinator
            .ingest(&Document::new("doc", "a b c d e f g"), &cancel, None)
            .await
            .unwrap();

        assert_eq!(report.state, IngestionState::PartiallyFailed);
        assert_eq!(report.failed.len(), report.total_chunks);
        assert!(report.failed.values().all(|r| r == CANCELLED_REASON));
        assert_eq!(store.count("test").await.unwrap(), 0);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let (tx, rx) = watch::channel(IngestionState::Pending);
        advance(Some(&tx), IngestionState::Writing);
        advance(Some(&tx), IngestionState::Embedding);
        assert_eq!(*rx.borrow(), IngestionState::Writing);

        advance(Some(&tx), IngestionState::PartiallyFailed);
        advance(Some(&tx), IngestionState::Completed);
        assert_eq!(*rx.borrow(), IngestionState::PartiallyFailed);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_error() {
        let result: Result<()> = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RagxError::Timeout(_))));
    }
}
