use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::vector_store::{RecordPayload, VectorHit, VectorRecord, VectorStore};
use common::http::is_transient_status;
use common::{GraphRagError, Result};

/// Vector store talking to Qdrant's REST API.
pub struct QdrantVectorStore {
    base_url: String,
    client: reqwest::Client,
    collection_name: String,
}

#[derive(Serialize)]
struct CreateCollection {
    vectors: VectorParams,
}

#[derive(Serialize)]
struct VectorParams {
    size: usize,
    distance: String,
}

#[derive(Serialize)]
struct UpsertPoints {
    points: Vec<Point>,
}

#[derive(Serialize)]
struct Point {
    id: u64,
    vector: Vec<f32>,
    payload: StoredPayload,
}

/// Payload as stored in Qdrant: the record payload plus the record id, since point
/// ids are numeric.
#[derive(Serialize, Deserialize)]
struct StoredPayload {
    record_id: String,
    #[serde(flatten)]
    payload: RecordPayload,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    score_threshold: Option<f32>,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    score: f32,
    payload: StoredPayload,
}

#[derive(Deserialize)]
struct CollectionList {
    result: CollectionListResult,
}

#[derive(Deserialize)]
struct CollectionListResult {
    collections: Vec<CollectionName>,
}

#[derive(Deserialize)]
struct CollectionName {
    name: String,
}

#[derive(Deserialize)]
struct CollectionInfo {
    result: CollectionInfoResult,
}

#[derive(Deserialize)]
struct CollectionInfoResult {
    config: CollectionConfig,
}

#[derive(Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Deserialize)]
struct CollectionParams {
    vectors: VectorSize,
}

#[derive(Deserialize)]
struct VectorSize {
    size: usize,
}

#[derive(Deserialize)]
struct CountResponse {
    result: CountResult,
}

#[derive(Deserialize)]
struct CountResult {
    count: usize,
}

/// Numeric point id derived from the record id. Stable across processes.
pub fn point_id(record_id: &str) -> u64 {
    let digest = Sha256::digest(record_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn store_error(e: reqwest::Error) -> GraphRagError {
    if e.is_timeout() || e.is_connect() {
        GraphRagError::TransientServiceError(e.to_string())
    } else {
        GraphRagError::VectorStoreError(e.to_string())
    }
}

async fn check_status(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} failed with status {}: {}", action, status, body.trim());
    if is_transient_status(status) {
        Err(GraphRagError::TransientServiceError(message))
    } else {
        Err(GraphRagError::VectorStoreError(message))
    }
}

impl QdrantVectorStore {
    pub fn new(base_url: String, collection_name: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            client,
            collection_name,
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection_name)
    }

    async fn collection_exists(&self) -> Result<bool> {
        let url = format!("{}/collections", self.base_url);
        let response = self.client.get(&url).send().await.map_err(store_error)?;
        let list: CollectionList = check_status(response, "list collections")
            .await?
            .json()
            .await
            .map_err(store_error)?;
        Ok(list
            .result
            .collections
            .iter()
            .any(|c| c.name == self.collection_name))
    }

    async fn collection_dimension(&self) -> Result<usize> {
        let response = self
            .client
            .get(self.collection_url())
            .send()
            .await
            .map_err(store_error)?;
        let info: CollectionInfo = check_status(response, "get collection")
            .await?
            .json()
            .await
            .map_err(store_error)?;
        Ok(info.result.config.params.vectors.size)
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn init(&self, dimension: usize) -> Result<()> {
        if self.collection_exists().await? {
            let existing = self.collection_dimension().await?;
            if existing != dimension {
                return Err(GraphRagError::VectorStoreError(format!(
                    "collection '{}' has dimension {}, embedder produces {}",
                    self.collection_name, existing, dimension
                )));
            }
            tracing::info!(collection = %self.collection_name, "Collection already exists");
            return Ok(());
        }

        tracing::info!(collection = %self.collection_name, dimension, "Creating collection");
        let request = CreateCollection {
            vectors: VectorParams {
                size: dimension,
                distance: "Cosine".to_string(),
            },
        };
        let response = self
            .client
            .put(self.collection_url())
            .json(&request)
            .send()
            .await
            .map_err(store_error)?;
        check_status(response, "create collection").await?;
        Ok(())
    }

    async fn upsert(&self, record: VectorRecord) -> Result<()> {
        let request = UpsertPoints {
            points: vec![Point {
                id: point_id(&record.id),
                vector: record.vector,
                payload: StoredPayload {
                    record_id: record.id,
                    payload: record.payload,
                },
            }],
        };
        let url = format!("{}/points?wait=true", self.collection_url());
        let response = self
            .client
            .put(&url)
            .json(&request)
            .send()
            .await
            .map_err(store_error)?;
        check_status(response, "upsert point").await?;
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<VectorHit>> {
        let request = SearchRequest {
            vector,
            limit,
            with_payload: true,
            score_threshold: threshold,
        };
        let url = format!("{}/points/search", self.collection_url());

        let search = async {
            let response = self
                .client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(store_error)?;
            check_status(response, "search")
                .await?
                .json::<SearchResponse>()
                .await
                .map_err(store_error)
        };
        let response = search.await.map_err(|e| match e {
            GraphRagError::VectorStoreError(message) => GraphRagError::RetrievalError(message),
            other => other,
        })?;

        Ok(response
            .result
            .into_iter()
            .map(|point| VectorHit {
                id: point.payload.record_id,
                score: point.score,
                payload: point.payload.payload,
            })
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        let url = format!("{}/points/count", self.collection_url());
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "exact": true }))
            .send()
            .await
            .map_err(store_error)?;
        let count: CountResponse = check_status(response, "count points")
            .await?
            .json()
            .await
            .map_err(store_error)?;
        Ok(count.result.count)
    }
}
