//! In-process flat index
//!
//! Exact brute-force search over every record of a collection, O(n) per
//! query. This is the reference backend: ranking is fully deterministic and
//! writes are visible to the next read. Collections can be snapshotted to a
//! JSON file so the index survives process restarts.

use crate::similarity::score;
use crate::{
    check_record_dimensions, reject_reason, unknown_collection, validate_schema_request,
    validate_search, VectorStore,
};
use async_trait::async_trait;
use ragx_core::{
    sort_by_relevance, CollectionSchema, EmbeddingRecord, InsertOutcome, RagxError, Result,
    SearchResult, SimilarityMetric,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlatCollection {
    schema: CollectionSchema,
    records: BTreeMap<Uuid, EmbeddingRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    collections: BTreeMap<String, FlatCollection>,
}

/// In-memory exact vector index
pub struct FlatIndexStore {
    collections: RwLock<BTreeMap<String, FlatCollection>>,
    snapshot_path: Option<PathBuf>,
    closed: AtomicBool,
}

impl FlatIndexStore {
    /// Create an empty, purely in-memory store
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
            snapshot_path: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Open a store backed by a snapshot file, loading it if present
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes).map_err(|e| {
                RagxError::InvalidConfig(format!(
                    "corrupt snapshot {}: {e}",
                    path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            "Flat index opened from {} ({} collections)",
            path.display(),
            snapshot.collections.len()
        );

        Ok(Self {
            collections: RwLock::new(snapshot.collections),
            snapshot_path: Some(path),
            closed: AtomicBool::new(false),
        })
    }

    /// Write the snapshot file, if one is configured
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let bytes = {
            let collections = self.collections.read().await;
            let snapshot = SnapshotRef {
                collections: &collections,
            };
            serde_json::to_vec(&snapshot).map_err(anyhow::Error::from)?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!("Flat index snapshot written to {}", path.display());
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RagxError::StoreUnavailable("flat index is closed".to_string()));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    collections: &'a BTreeMap<String, FlatCollection>,
}

impl Default for FlatIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for FlatIndexStore {
    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: SimilarityMetric,
    ) -> Result<()> {
        self.ensure_open()?;
        validate_schema_request(dimension)?;

        let mut collections = self.collections.write().await;
        if let Some(existing) = collections.get(name) {
            return existing.schema.ensure_compatible(dimension, metric);
        }

        collections.insert(
            name.to_string(),
            FlatCollection {
                schema: CollectionSchema::new(name, dimension, metric),
                records: BTreeMap::new(),
            },
        );
        info!("Created flat collection '{name}' (dimension={dimension}, metric={metric})");
        Ok(())
    }

    async fn collection_schema(&self, name: &str) -> Result<Option<CollectionSchema>> {
        self.ensure_open()?;
        let collections = self.collections.read().await;
        Ok(collections.get(name).map(|c| c.schema.clone()))
    }

    async fn insert(
        &self,
        collection: &str,
        records: &[EmbeddingRecord],
    ) -> Result<InsertOutcome> {
        self.ensure_open()?;

        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| unknown_collection(collection))?;
        check_record_dimensions(&target.schema, records)?;

        let mut outcome = InsertOutcome::default();
        for record in records {
            match reject_reason(record) {
                Some(reason) => outcome.failed.push((record.id, reason)),
                None => {
                    target.records.insert(record.id, record.clone());
                    outcome.succeeded.push(record.id);
                }
            }
        }

        debug!(
            "Upserted {} records into '{collection}' ({} rejected)",
            outcome.succeeded.len(),
            outcome.failed.len()
        );
        Ok(outcome)
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
        metric: SimilarityMetric,
    ) -> Result<Vec<SearchResult>> {
        self.ensure_open()?;

        let collections = self.collections.read().await;
        let target = collections
            .get(collection)
            .ok_or_else(|| unknown_collection(collection))?;
        validate_search(&target.schema, query_vector, top_k, metric)?;

        let mut results: Vec<SearchResult> = target
            .records
            .values()
            .map(|record| SearchResult {
                record_id: record.id,
                document_id: record.document_id.clone(),
                chunk_id: record.chunk_id.clone(),
                content: record.content.clone(),
                score: score(metric, query_vector, &record.vector),
            })
            .collect();

        sort_by_relevance(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    async fn delete_by_document(&self, collection: &str, document_id: &str) -> Result<u64> {
        self.ensure_open()?;

        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| unknown_collection(collection))?;

        let before = target.records.len();
        target.records.retain(|_, r| r.document_id != document_id);
        let deleted = (before - target.records.len()) as u64;

        debug!("Deleted {deleted} records of document {document_id}");
        Ok(deleted)
    }

    async fn delete_stale(
        &self,
        collection: &str,
        document_id: &str,
        fingerprint: &str,
        chunk_count: usize,
    ) -> Result<u64> {
        self.ensure_open()?;

        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| unknown_collection(collection))?;

        let before = target.records.len();
        target.records.retain(|_, r| {
            r.document_id != document_id
                || (r.fingerprint == fingerprint && (r.chunk_index as usize) < chunk_count)
        });
        Ok((before - target.records.len()) as u64)
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        self.ensure_open()?;
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|c| c.records.len() as u64)
            .ok_or_else(|| unknown_collection(collection))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.persist().await?;
        info!("Flat index closed");
        Ok(())
    }

    fn name(&self) -> &str {
        "flat"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u128, document_id: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            id: Uuid::from_u128(id),
            document_id: document_id.to_string(),
            chunk_id: format!("{id:05}-test"),
            chunk_index: id as u32,
            content: format!("chunk {id}"),
            vector,
            fingerprint: "test".to_string(),
        }
    }

    async fn store_with(records: &[EmbeddingRecord]) -> FlatIndexStore {
        let store = FlatIndexStore::new();
        store
            .create_collection("chunks", 2, SimilarityMetric::Cosine)
            .await
            .unwrap();
        store.insert("chunks", records).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_collection_is_idempotent() {
        let store = FlatIndexStore::new();
        store
            .create_collection("chunks", 3, SimilarityMetric::Cosine)
            .await
            .unwrap();
        store
            .create_collection("chunks", 3, SimilarityMetric::Cosine)
            .await
            .unwrap();

        assert!(matches!(
            store
                .create_collection("chunks", 4, SimilarityMetric::Cosine)
                .await,
            Err(RagxError::SchemaConflict { .. })
        ));
        assert!(matches!(
            store.create_collection("chunks", 3, SimilarityMetric::L2).await,
            Err(RagxError::SchemaConflict { .. })
        ));
        assert!(matches!(
            store
                .create_collection("empty", 0, SimilarityMetric::Cosine)
                .await,
            Err(RagxError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_ranking_with_ties() {
        // Records 2 and 3 point the same way, record 1 is orthogonal
        let store = store_with(&[
            record(3, "doc", vec![1.0, 1.0]),
            record(1, "doc", vec![0.0, 1.0]),
            record(2, "doc", vec![1.0, 1.0]),
        ])
        .await;

        let results = store
            .search("chunks", &[1.0, 1.0], 2, SimilarityMetric::Cosine)
            .await
            .unwrap();

        let ids: Vec<u128> = results.iter().map(|r| r.record_id.as_u128()).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_search_validation() {
        let store = store_with(&[record(1, "doc", vec![1.0, 0.0])]).await;

        assert!(matches!(
            store
                .search("chunks", &[1.0, 0.0, 0.0], 1, SimilarityMetric::Cosine)
                .await,
            Err(RagxError::InvalidConfig(_))
        ));
        assert!(matches!(
            store
                .search("chunks", &[1.0, 0.0], 0, SimilarityMetric::Cosine)
                .await,
            Err(RagxError::InvalidConfig(_))
        ));
        assert!(matches!(
            store
                .search("chunks", &[1.0, 0.0], 1, SimilarityMetric::Dot)
                .await,
            Err(RagxError::InvalidConfig(_))
        ));
        assert!(matches!(
            store
                .search("missing", &[1.0, 0.0], 1, SimilarityMetric::Cosine)
                .await,
            Err(RagxError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_search_rejects_non_finite_query() {
        let store = store_with(&[record(1, "doc", vec![1.0, 0.0])]).await;

        for query in [[f32::NAN, 0.0], [f32::INFINITY, 1.0]] {
            assert!(matches!(
                store
                    .search("chunks", &query, 1, SimilarityMetric::Cosine)
                    .await,
                Err(RagxError::InvalidConfig(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_insert_dimension_mismatch_is_fatal() {
        let store = store_with(&[]).await;
        let result = store
            .insert(
                "chunks",
                &[
                    record(1, "doc", vec![1.0, 0.0]),
                    record(2, "doc", vec![1.0, 0.0, 0.0]),
                ],
            )
            .await;

        assert!(matches!(
            result,
            Err(RagxError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert_eq!(store.count("chunks").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_reports_rejected_records() {
        let store = store_with(&[]).await;
        let outcome = store
            .insert(
                "chunks",
                &[
                    record(1, "doc", vec![1.0, 0.0]),
                    record(2, "doc", vec![f32::NAN, 0.0]),
                ],
            )
            .await
            .unwrap();

        assert_eq!(outcome.succeeded, vec![Uuid::from_u128(1)]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, Uuid::from_u128(2));
        assert_eq!(store.count("chunks").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_is_upsert() {
        let store = store_with(&[record(1, "doc", vec![1.0, 0.0])]).await;
        store
            .insert("chunks", &[record(1, "doc", vec![0.0, 1.0])])
            .await
            .unwrap();

        assert_eq!(store.count("chunks").await.unwrap(), 1);
        let results = store
            .search("chunks", &[0.0, 1.0], 1, SimilarityMetric::Cosine)
            .await
            .unwrap();
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_delete_by_document() {
        let store = store_with(&[
            record(1, "a", vec![1.0, 0.0]),
            record(2, "a", vec![0.0, 1.0]),
            record(3, "b", vec![1.0, 1.0]),
        ])
        .await;

        assert_eq!(store.delete_by_document("chunks", "a").await.unwrap(), 2);
        assert_eq!(store.delete_by_document("chunks", "a").await.unwrap(), 0);

        let results = store
            .search("chunks", &[1.0, 0.0], 10, SimilarityMetric::Cosine)
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.document_id != "a"));
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_stale_keeps_current_fingerprint() {
        let mut old = record(1, "a", vec![1.0, 0.0]);
        old.fingerprint = "old".to_string();
        let current = record(2, "a", vec![0.0, 1.0]);
        let mut other_doc = record(3, "b", vec![1.0, 1.0]);
        other_doc.fingerprint = "old".to_string();

        let store = store_with(&[old, current, other_doc]).await;
        assert_eq!(store.delete_stale("chunks", "a", "test", 3).await.unwrap(), 1);
        assert_eq!(store.count("chunks").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_stale_drops_trailing_chunks() {
        let store = store_with(&[
            record(0, "a", vec![1.0, 0.0]),
            record(1, "a", vec![0.0, 1.0]),
            record(2, "a", vec![1.0, 1.0]),
            record(3, "b", vec![1.0, 0.5]),
        ])
        .await;

        assert_eq!(store.delete_stale("chunks", "a", "test", 1).await.unwrap(), 2);

        let results = store
            .search("chunks", &[1.0, 1.0], 10, SimilarityMetric::Cosine)
            .await
            .unwrap();
        let mut ids: Vec<_> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["00000-test", "00003-test"]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = store_with(&[]).await;
        store.close().await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(
            store.count("chunks").await,
            Err(RagxError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index").join("snapshot.json");

        let store = FlatIndexStore::open(&path).await.unwrap();
        store
            .create_collection("chunks", 2, SimilarityMetric::Cosine)
            .await
            .unwrap();
        store
            .insert("chunks", &[record(1, "doc", vec![1.0, 0.0])])
            .await
            .unwrap();
        store.close().await.unwrap();

        let reopened = FlatIndexStore::open(&path).await.unwrap();
        assert_eq!(reopened.count("chunks").await.unwrap(), 1);
        assert_eq!(
            reopened.collection_schema("chunks").await.unwrap(),
            Some(CollectionSchema::new("chunks", 2, SimilarityMetric::Cosine))
        );
    }
}
