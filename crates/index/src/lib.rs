pub mod embeddings;
pub mod graph;
pub mod memory_graph;
pub mod neo4j_index;
pub mod qdrant_index;
pub mod upserter;
pub mod vector_indexer;
pub mod vector_store;

pub use embeddings::{Embedder, EmbeddingClient, OpenAiEmbeddingClient};
pub use graph::{EdgeAttrs, Entity, GraphStats, GraphStore, Relation, RelationId, Subgraph, VertexAttrs};
pub use memory_graph::MemoryGraphStore;
pub use neo4j_index::Neo4jGraphStore;
pub use qdrant_index::QdrantVectorStore;
pub use upserter::{GraphUpserter, UpsertReport};
pub use vector_indexer::VectorIndexer;
pub use vector_store::{MemoryVectorStore, RecordKind, RecordPayload, VectorHit, VectorRecord, VectorStore};

use serde::Serialize;
use std::sync::Arc;

use common::Result;

/// Graph and vector stores initialized and reported on together.
#[derive(Clone)]
pub struct Indexer {
    pub upserter: GraphUpserter,
    pub vectors: VectorIndexer,
}

impl Indexer {
    pub fn new(graph: Arc<dyn GraphStore>, vectors: VectorIndexer) -> Self {
        Self {
            upserter: GraphUpserter::new(graph),
            vectors,
        }
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        self.upserter.store()
    }

    /// Initialize both stores
    pub async fn init(&self) -> Result<()> {
        tracing::info!("Initializing graph store");
        self.graph().init().await?;

        tracing::info!("Initializing vector store");
        self.vectors.init().await?;

        Ok(())
    }

    /// Get overall stats
    pub async fn stats(&self) -> Result<IndexStats> {
        let graph_stats = self.graph().stats().await?;
        let vectors = self.vectors.store().count().await?;

        Ok(IndexStats {
            entities: graph_stats.entity_count,
            relations: graph_stats.relation_count,
            vectors,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub entities: usize,
    pub relations: usize,
    pub vectors: usize,
}
