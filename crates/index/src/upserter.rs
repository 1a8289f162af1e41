use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::graph::{EdgeAttrs, GraphStore, RelationId, VertexAttrs};
use common::{GraphRagError, Result};
use extract::{EntityKey, ExtractedChunk};

/// Keys and relation ids touched by one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertReport {
    pub entity_keys: BTreeSet<EntityKey>,
    pub relation_ids: BTreeSet<RelationId>,
}

impl UpsertReport {
    pub fn extend(&mut self, other: UpsertReport) {
        self.entity_keys.extend(other.entity_keys);
        self.relation_ids.extend(other.relation_ids);
    }
}

/// A batch collapsed to one vertex per key and one edge per triple.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoalescedBatch {
    pub vertices: BTreeMap<EntityKey, VertexAttrs>,
    pub edges: BTreeMap<RelationId, EdgeAttrs>,
}

/// Merges a batch of chunk extractions into the graph.
#[derive(Clone)]
pub struct GraphUpserter {
    store: Arc<dyn GraphStore>,
}

impl GraphUpserter {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Collapse stubs by key. Endpoints that no entity stub describes get a placeholder
    /// vertex with no display name.
    pub fn coalesce(batch: &[ExtractedChunk]) -> CoalescedBatch {
        let mut coalesced = CoalescedBatch::default();

        for extracted in batch {
            for stub in &extracted.extraction.entities {
                let attrs = VertexAttrs {
                    display_name: stub.display_name.clone(),
                    source_chunk_ids: BTreeSet::from([stub.source_chunk_id.clone()]),
                    summaries: stub.summary.iter().cloned().collect(),
                };
                coalesced
                    .vertices
                    .entry(stub.key.clone())
                    .or_default()
                    .merge(&attrs);
            }

            for stub in &extracted.extraction.relations {
                for endpoint in [&stub.subject, &stub.object] {
                    coalesced.vertices.entry(endpoint.clone()).or_default();
                }
                let attrs = EdgeAttrs {
                    source_chunk_ids: BTreeSet::from([stub.source_chunk_id.clone()]),
                    evidence: stub.evidence.iter().cloned().collect(),
                    confidence: stub.confidence,
                };
                let id = RelationId {
                    subject: stub.subject.clone(),
                    predicate: stub.predicate.clone(),
                    object: stub.object.clone(),
                };
                coalesced.edges.entry(id).or_default().merge(&attrs);
            }
        }

        coalesced
    }

    /// Upsert all vertices, then all edges. Any store rejection aborts the rest of the batch.
    pub async fn upsert_batch(&self, batch: &[ExtractedChunk]) -> Result<UpsertReport> {
        let coalesced = Self::coalesce(batch);
        let mut report = UpsertReport::default();

        for (key, attrs) in &coalesced.vertices {
            self.store
                .upsert_vertex(key, attrs)
                .await
                .map_err(as_write_error)?;
            report.entity_keys.insert(key.clone());
        }

        for (id, attrs) in &coalesced.edges {
            self.store
                .upsert_edge(&id.subject, &id.predicate, &id.object, attrs)
                .await
                .map_err(as_write_error)?;
            report.relation_ids.insert(id.clone());
        }

        tracing::debug!(
            chunks = batch.len(),
            vertices = report.entity_keys.len(),
            edges = report.relation_ids.len(),
            "Upserted batch"
        );
        Ok(report)
    }
}

/// Transient store failures keep their kind so the caller can retry the batch.
fn as_write_error(e: GraphRagError) -> GraphRagError {
    match e {
        GraphRagError::GraphWriteError(_) | GraphRagError::TransientServiceError(_) => e,
        other => GraphRagError::GraphWriteError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_graph::MemoryGraphStore;
    use extract::{EntityStub, ExtractionResult, RelationStub};
    use pretty_assertions::assert_eq;

    fn key(name: &str, entity_type: &str) -> EntityKey {
        EntityKey {
            name: name.into(),
            entity_type: entity_type.into(),
        }
    }

    fn entity(chunk: &str, display: &str, entity_type: &str, summary: Option<&str>) -> EntityStub {
        EntityStub {
            key: key(&display.to_lowercase(), entity_type),
            display_name: display.into(),
            summary: summary.map(String::from),
            source_chunk_id: chunk.into(),
            confidence: None,
        }
    }

    fn relation(chunk: &str, s: EntityKey, p: &str, o: EntityKey, confidence: Option<f32>) -> RelationStub {
        RelationStub {
            subject: s,
            predicate: p.into(),
            object: o,
            source_chunk_id: chunk.into(),
            evidence: None,
            confidence,
        }
    }

    fn extracted(chunk: &str, entities: Vec<EntityStub>, relations: Vec<RelationStub>) -> ExtractedChunk {
        ExtractedChunk {
            chunk_id: chunk.into(),
            doc_id: "doc".into(),
            extraction: ExtractionResult { entities, relations },
        }
    }

    fn batch_one() -> ExtractedChunk {
        extracted(
            "c1",
            vec![
                entity("c1", "Alice", "person", Some("An engineer")),
                entity("c1", "Acme", "organization", None),
            ],
            vec![relation("c1", key("alice", "person"), "works_at", key("acme", "organization"), Some(0.6))],
        )
    }

    fn batch_two() -> ExtractedChunk {
        extracted(
            "c2",
            vec![entity("c2", "ACME", "organization", Some("A company"))],
            vec![
                relation("c2", key("alice", "person"), "works_at", key("acme", "organization"), Some(0.9)),
                relation("c2", key("acme", "organization"), "based_in", key("springfield", "location"), None),
            ],
        )
    }

    async fn snapshot(store: &MemoryGraphStore) -> (Vec<crate::graph::Entity>, Vec<crate::graph::Relation>) {
        (store.entities(), store.relations())
    }

    #[tokio::test]
    async fn test_batches_commute() {
        let forward = Arc::new(MemoryGraphStore::new());
        let upserter = GraphUpserter::new(forward.clone());
        upserter.upsert_batch(&[batch_one()]).await.unwrap();
        upserter.upsert_batch(&[batch_two()]).await.unwrap();

        let backward = Arc::new(MemoryGraphStore::new());
        let upserter = GraphUpserter::new(backward.clone());
        upserter.upsert_batch(&[batch_two()]).await.unwrap();
        upserter.upsert_batch(&[batch_one()]).await.unwrap();

        assert_eq!(snapshot(&forward).await, snapshot(&backward).await);

        let (entities, relations) = snapshot(&forward).await;
        assert_eq!(entities.len(), 3);
        assert_eq!(relations.len(), 2);
        let acme = entities.iter().find(|e| e.key == key("acme", "organization")).unwrap();
        assert_eq!(acme.attrs.display_name, "ACME");
        assert_eq!(acme.attrs.source_chunk_ids.len(), 2);
        let works_at = relations.iter().find(|r| r.predicate == "works_at").unwrap();
        assert_eq!(works_at.attrs.confidence, Some(0.9));
    }

    #[tokio::test]
    async fn test_reupsert_is_idempotent() {
        let store = Arc::new(MemoryGraphStore::new());
        let upserter = GraphUpserter::new(store.clone());
        upserter.upsert_batch(&[batch_one(), batch_two()]).await.unwrap();
        let first = snapshot(&store).await;

        upserter.upsert_batch(&[batch_one(), batch_two()]).await.unwrap();
        assert_eq!(snapshot(&store).await, first);
    }

    #[tokio::test]
    async fn test_placeholder_for_undescribed_endpoint() {
        let store = Arc::new(MemoryGraphStore::new());
        let report = GraphUpserter::new(store.clone())
            .upsert_batch(&[batch_two()])
            .await
            .unwrap();

        assert!(report.entity_keys.contains(&key("springfield", "location")));
        let springfield = store
            .entities()
            .into_iter()
            .find(|e| e.key == key("springfield", "location"))
            .unwrap();
        assert_eq!(springfield.attrs.display_name, "");
        assert_eq!(springfield.display_name(), "springfield");
    }

    #[test]
    fn test_coalesce_collapses_by_key() {
        let coalesced = GraphUpserter::coalesce(&[batch_one(), batch_two()]);
        assert_eq!(coalesced.vertices.len(), 3);
        assert_eq!(coalesced.edges.len(), 2);
        let acme = &coalesced.vertices[&key("acme", "organization")];
        assert_eq!(
            acme.summaries.iter().cloned().collect::<Vec<_>>(),
            vec!["A company".to_string()]
        );
    }
}
