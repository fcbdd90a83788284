//! Qdrant implementation for vector storage
//!
//! Provides connection management and vector operations for chunk
//! embeddings in a remote Qdrant index. Qdrant applies writes
//! asynchronously across its segments, so callers must treat this
//! backend as eventually consistent: a search issued right after an
//! insert may not see the new records yet.
//!
//! Author: hephaex@gmail.com

use crate::{
    check_record_dimensions, reject_reason, unknown_collection, validate_schema_request,
    validate_search, VectorStore,
};
use async_trait::async_trait;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::vectors_config::Config as VectorsConfigKind;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, Distance, FieldType, Filter, PointStruct, Range, ScoredPoint,
    SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use ragx_core::{
    sort_by_relevance, CollectionSchema, EmbeddingRecord, InsertOutcome, RagxError, Result,
    SearchResult, SimilarityMetric, StoreConfig,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Qdrant vector store implementation
pub struct QdrantStore {
    client: Qdrant,
    schemas: RwLock<HashMap<String, CollectionSchema>>,
    closed: AtomicBool,
}

impl QdrantStore {
    /// Create a new Qdrant connection
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        let mut builder =
            Qdrant::from_url(&config.qdrant_url).timeout(Duration::from_secs(config.timeout_secs));
        if let Some(key) = &config.qdrant_api_key {
            builder = builder.api_key(key.clone());
        }

        let client = builder
            .build()
            .map_err(|e| RagxError::StoreUnavailable(format!("Qdrant connection failed: {e}")))?;

        info!("Qdrant client configured for {}", config.qdrant_url);

        Ok(Self {
            client,
            schemas: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RagxError::StoreUnavailable(
                "qdrant store is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Schema from the local cache, falling back to the server
    async fn schema(&self, collection: &str) -> Result<CollectionSchema> {
        if let Some(schema) = self.schemas.read().await.get(collection) {
            return Ok(schema.clone());
        }
        self.fetch_schema(collection)
            .await?
            .ok_or_else(|| unknown_collection(collection))
    }

    async fn fetch_schema(&self, collection: &str) -> Result<Option<CollectionSchema>> {
        let exists = self
            .client
            .collection_exists(collection)
            .await
            .map_err(|e| unavailable("Failed to check collection", e))?;
        if !exists {
            return Ok(None);
        }

        let info = self
            .client
            .collection_info(collection)
            .await
            .map_err(|e| unavailable("Failed to read collection info", e))?;

        let params = info
            .result
            .and_then(|i| i.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config);

        let schema = match params {
            Some(VectorsConfigKind::Params(params)) => {
                let metric = metric_from_distance(params.distance).ok_or_else(|| {
                    RagxError::SchemaConflict {
                        collection: collection.to_string(),
                        reason: format!("unsupported distance {}", params.distance),
                    }
                })?;
                CollectionSchema::new(collection, params.size as usize, metric)
            }
            _ => {
                return Err(RagxError::SchemaConflict {
                    collection: collection.to_string(),
                    reason: "collection uses named vectors".to_string(),
                })
            }
        };

        self.schemas
            .write()
            .await
            .insert(collection.to_string(), schema.clone());
        Ok(Some(schema))
    }

    async fn count_matching(&self, collection: &str, filter: Filter) -> Result<u64> {
        let response = self
            .client
            .count(CountPointsBuilder::new(collection).filter(filter).exact(true))
            .await
            .map_err(|e| unavailable("Failed to count vectors", e))?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    async fn delete_matching(&self, collection: &str, filter: Filter) -> Result<u64> {
        self.ensure_open()?;
        self.schema(collection).await?;

        // Qdrant does not report how many points a filter delete removed
        let matching = self.count_matching(collection, filter.clone()).await?;
        if matching == 0 {
            return Ok(0);
        }

        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(|e| unavailable("Failed to delete vectors", e))?;

        Ok(matching)
    }
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> RagxError {
    RagxError::StoreUnavailable(format!("{context}: {err}"))
}

/// Payload stored with each vector
#[derive(Debug, Clone, Serialize)]
struct VectorPayload<'a> {
    document_id: &'a str,
    chunk_id: &'a str,
    chunk_index: u32,
    content: &'a str,
    fingerprint: &'a str,
}

fn record_payload(record: &EmbeddingRecord) -> HashMap<String, Value> {
    let payload = VectorPayload {
        document_id: &record.document_id,
        chunk_id: &record.chunk_id,
        chunk_index: record.chunk_index,
        content: &record.content,
        fingerprint: &record.fingerprint,
    };

    serde_json::to_value(&payload)
        .unwrap_or_default()
        .as_object()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.into()))
        .collect()
}

fn payload_str(payload: &HashMap<String, Value>, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

fn scored_point_to_result(point: ScoredPoint, metric: SimilarityMetric) -> Option<SearchResult> {
    let record_id = match point.id?.point_id_options? {
        PointIdOptions::Uuid(id) => Uuid::parse_str(&id).ok()?,
        PointIdOptions::Num(_) => return None,
    };

    // Qdrant reports Euclid as a distance (lower is better)
    let score = match metric {
        SimilarityMetric::L2 => -point.score,
        _ => point.score,
    };

    Some(SearchResult {
        record_id,
        document_id: payload_str(&point.payload, "document_id"),
        chunk_id: payload_str(&point.payload, "chunk_id"),
        content: payload_str(&point.payload, "content"),
        score,
    })
}

fn document_filter(document_id: &str) -> Condition {
    Condition::matches("document_id", document_id.to_string())
}

/// Records of `document_id` from another fingerprint or past the last chunk
fn stale_filter(document_id: &str, fingerprint: &str, chunk_count: usize) -> Filter {
    Filter {
        must: vec![document_filter(document_id)],
        should: vec![
            Filter::must_not([Condition::matches("fingerprint", fingerprint.to_string())]).into(),
            Condition::range(
                "chunk_index",
                Range {
                    gte: Some(chunk_count as f64),
                    ..Default::default()
                },
            ),
        ],
        ..Default::default()
    }
}

pub(crate) fn distance_for(metric: SimilarityMetric) -> Distance {
    match metric {
        SimilarityMetric::Cosine => Distance::Cosine,
        SimilarityMetric::Dot => Distance::Dot,
        SimilarityMetric::L2 => Distance::Euclid,
    }
}

pub(crate) fn metric_from_distance(distance: i32) -> Option<SimilarityMetric> {
    [
        SimilarityMetric::Cosine,
        SimilarityMetric::Dot,
        SimilarityMetric::L2,
    ]
    .into_iter()
    .find(|metric| distance_for(*metric) as i32 == distance)
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: SimilarityMetric,
    ) -> Result<()> {
        self.ensure_open()?;
        validate_schema_request(dimension)?;

        if let Some(existing) = self.fetch_schema(name).await? {
            return existing.ensure_compatible(dimension, metric);
        }

        let created = self
            .client
            .create_collection(
                CreateCollectionBuilder::new(name).vectors_config(VectorParamsBuilder::new(
                    dimension as u64,
                    distance_for(metric),
                )),
            )
            .await;

        if let Err(e) = created {
            // Another process may have created it concurrently
            return match self.fetch_schema(name).await? {
                Some(existing) => existing.ensure_compatible(dimension, metric),
                None => Err(unavailable("Failed to create collection", e)),
            };
        }

        if let Err(e) = self
            .client
            .create_field_index(CreateFieldIndexCollectionBuilder::new(
                name,
                "document_id",
                FieldType::Keyword,
            ))
            .await
        {
            warn!("Failed to index document_id on '{name}': {e}");
        }

        self.schemas.write().await.insert(
            name.to_string(),
            CollectionSchema::new(name, dimension, metric),
        );
        info!("Created Qdrant collection '{name}' (dimension={dimension}, metric={metric})");
        Ok(())
    }

    async fn collection_schema(&self, name: &str) -> Result<Option<CollectionSchema>> {
        self.ensure_open()?;
        self.fetch_schema(name).await
    }

    async fn insert(
        &self,
        collection: &str,
        records: &[EmbeddingRecord],
    ) -> Result<InsertOutcome> {
        self.ensure_open()?;
        let schema = self.schema(collection).await?;
        check_record_dimensions(&schema, records)?;

        let mut outcome = InsertOutcome::default();
        let mut points = Vec::with_capacity(records.len());
        let mut ids = Vec::with_capacity(records.len());

        for record in records {
            if let Some(reason) = reject_reason(record) {
                outcome.failed.push((record.id, reason));
                continue;
            }
            points.push(PointStruct::new(
                record.id.to_string(),
                record.vector.clone(),
                record_payload(record),
            ));
            ids.push(record.id);
        }

        if points.is_empty() {
            return Ok(outcome);
        }

        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
            .await
            .map_err(|e| unavailable("Failed to upsert vectors", e))?;

        debug!("Upserted {} points into '{collection}'", ids.len());
        outcome.succeeded = ids;
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
        let schema = self.schema(collection).await?;
        validate_search(&schema, query_vector, top_k, metric)?;

        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(collection, query_vector.to_vec(), top_k as u64)
                    .with_payload(true),
            )
            .await
            .map_err(|e| unavailable("Vector search failed", e))?;

        let mut results: Vec<SearchResult> = response
            .result
            .into_iter()
            .filter_map(|point| scored_point_to_result(point, metric))
            .collect();

        sort_by_relevance(&mut results);
        Ok(results)
    }

    async fn delete_by_document(&self, collection: &str, document_id: &str) -> Result<u64> {
        let filter = Filter::must([document_filter(document_id)]);
        self.delete_matching(collection, filter).await
    }

    async fn delete_stale(
        &self,
        collection: &str,
        document_id: &str,
        fingerprint: &str,
        chunk_count: usize,
    ) -> Result<u64> {
        let filter = stale_filter(document_id, fingerprint, chunk_count);
        self.delete_matching(collection, filter).await
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        self.ensure_open()?;
        self.schema(collection).await?;
        self.count_matching(collection, Filter::default()).await
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.schemas.write().await.clear();
            info!("Qdrant store closed");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "qdrant"
    }
}
