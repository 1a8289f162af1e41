use std::sync::Arc;

use crate::embeddings::Embedder;
use crate::graph::Entity;
use crate::vector_store::{RecordKind, RecordPayload, VectorRecord, VectorStore};
use common::{GraphRagError, Result};
use extract::EntityKey;
use ingest::Chunk;

/// Embeds chunks and entities and writes them to the vector store by deterministic id.
#[derive(Clone)]
pub struct VectorIndexer {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
}

impl VectorIndexer {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Probe the embedder and make sure the collection matches its dimension.
    pub async fn init(&self) -> Result<usize> {
        let dimension = self.embedder.dimension().await?;
        self.store.init(dimension).await?;
        tracing::info!(model = self.embedder.model_name(), dimension, "Vector index ready");
        Ok(dimension)
    }

    pub async fn index_chunk(&self, chunk: &Chunk, entity_keys: &[EntityKey]) -> Result<String> {
        let record = VectorRecord {
            id: VectorRecord::chunk_id(&chunk.chunk_id),
            vector: self.embedder.embed(&chunk.text).await?,
            payload: RecordPayload {
                kind: RecordKind::Chunk,
                text: chunk.text.clone(),
                doc_id: Some(chunk.doc_id.clone()),
                source: Some(chunk.source.clone()),
                entity_keys: entity_keys.iter().map(EntityKey::id).collect(),
            },
        };
        self.write(record).await
    }

    pub async fn index_entity(&self, entity: &Entity) -> Result<String> {
        let text = entity.text_representation();
        let record = VectorRecord {
            id: VectorRecord::entity_id(&entity.key),
            vector: self.embedder.embed(&text).await?,
            payload: RecordPayload {
                kind: RecordKind::Entity,
                text,
                doc_id: None,
                source: None,
                entity_keys: vec![entity.key.id()],
            },
        };
        self.write(record).await
    }

    async fn write(&self, record: VectorRecord) -> Result<String> {
        let id = record.id.clone();
        self.store.upsert(record).await.map_err(|e| match e {
            GraphRagError::VectorStoreError(_) | GraphRagError::TransientServiceError(_) => e,
            other => GraphRagError::VectorStoreError(other.to_string()),
        })?;
        Ok(id)
    }
}
