//! Vector records and the similarity-search interface.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use common::{GraphRagError, Result};
use extract::EntityKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Chunk,
    Entity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub kind: RecordKind,
    pub text: String,
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Rendered keys (`type:name`) of the entities this record is about.
    #[serde(default)]
    pub entity_keys: Vec<String>,
}

impl RecordPayload {
    pub fn entity_keys(&self) -> Vec<EntityKey> {
        self.entity_keys
            .iter()
            .filter_map(|k| EntityKey::parse(k))
            .collect()
    }
}

/// A stored embedding. Ids are deterministic so re-indexing overwrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: RecordPayload,
}

impl VectorRecord {
    pub fn chunk_id(chunk_id: &str) -> String {
        format!("chunk:{}", chunk_id)
    }

    pub fn entity_id(key: &EntityKey) -> String {
        format!("entity:{}", key.id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub id: String,
    /// Cosine similarity, higher is closer.
    pub score: f32,
    pub payload: RecordPayload,
}

/// Similarity index. Writes and dimension problems fail with `VectorStoreError`,
/// searches with `RetrievalError`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Prepare the collection for vectors of `dimension`.
    async fn init(&self, dimension: usize) -> Result<()>;

    /// Insert or replace a record by id.
    async fn upsert(&self, record: VectorRecord) -> Result<()>;

    /// Up to `limit` nearest records, best first. Hits scoring below `threshold` are dropped.
    async fn search(&self, vector: &[f32], limit: usize, threshold: Option<f32>)
    -> Result<Vec<VectorHit>>;

    async fn count(&self) -> Result<usize>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Exhaustive-scan vector store for tests and small corpora.
#[derive(Default)]
pub struct MemoryVectorStore {
    records: DashMap<String, VectorRecord>,
    dimension: std::sync::OnceLock<usize>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<VectorRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    fn check_dimension(&self, len: usize) -> Result<()> {
        match self.dimension.get() {
            Some(&dimension) if dimension != len => Err(GraphRagError::VectorStoreError(format!(
                "vector has dimension {}, collection expects {}",
                len, dimension
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn init(&self, dimension: usize) -> Result<()> {
        let current = *self.dimension.get_or_init(|| dimension);
        if current != dimension {
            return Err(GraphRagError::VectorStoreError(format!(
                "collection already has dimension {}, requested {}",
                current, dimension
            )));
        }
        Ok(())
    }

    async fn upsert(&self, record: VectorRecord) -> Result<()> {
        self.check_dimension(record.vector.len())?;
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<VectorHit>> {
        self.check_dimension(vector.len())
            .map_err(|e| GraphRagError::RetrievalError(e.to_string()))?;

        let mut hits: Vec<VectorHit> = self
            .records
            .iter()
            .map(|r| VectorHit {
                id: r.id.clone(),
                score: cosine_similarity(vector, &r.vector),
                payload: r.payload.clone(),
            })
            .filter(|hit| threshold.is_none_or(|t| hit.score >= t))
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.len())
    }
}
