//! Hybrid retrieval: vector similarity and graph neighbourhood, merged into one ranking.

use petgraph::algo::dijkstra;
use petgraph::graph::{NodeIndex, UnGraph};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::evidence::{
    Coverage, EvidenceItem, EvidenceRef, QueryMode, RetrievalMethod, rank, rank_near_first,
};
use crate::keywords::query_keywords;
use common::{GraphRagError, Result};
use extract::{EntityKey, EntityNormalizer};
use index::{Embedder, GraphStore, RecordKind, RelationId, VectorHit, VectorRecord, VectorStore};

/// How a seed's score falls off with hop distance. `apply(0)` is always 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HopDecay {
    /// `factor^hops`
    Exponential { factor: f32 },
    /// `max(0, 1 - step * hops)`
    Linear { step: f32 },
    /// `1 / (1 + hops)`
    Reciprocal,
}

impl Default for HopDecay {
    fn default() -> Self {
        HopDecay::Exponential { factor: 0.5 }
    }
}

impl HopDecay {
    pub fn apply(&self, hops: usize) -> f32 {
        match *self {
            HopDecay::Exponential { factor } => factor.powi(hops as i32),
            HopDecay::Linear { step } => (1.0 - step * hops as f32).max(0.0),
            HopDecay::Reciprocal => 1.0 / (1.0 + hops as f32),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            HopDecay::Exponential { factor } if !(factor > 0.0 && factor <= 1.0) => Err(
                GraphRagError::InvalidConfig(format!("decay factor {} must be in (0, 1]", factor)),
            ),
            HopDecay::Linear { step } if !(step >= 0.0) => Err(GraphRagError::InvalidConfig(
                format!("decay step {} must be non-negative", step),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub decay: HopDecay,
    /// Multiplier applied to every graph-derived score.
    pub graph_weight: f32,
    /// Seed score for entities matched by name in the query.
    pub name_match_score: f32,
    pub max_graph_items: usize,
    /// Vector hits scoring below this are dropped.
    pub vector_score_threshold: Option<f32>,
    /// Order by hop distance before score, so one-hop neighbours precede two-hop ones.
    pub near_neighbor_first: bool,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            decay: HopDecay::default(),
            graph_weight: 1.0,
            name_match_score: 1.0,
            max_graph_items: 30,
            vector_score_threshold: None,
            near_neighbor_first: false,
        }
    }
}

impl RetrieverConfig {
    pub fn validate(&self) -> Result<()> {
        self.decay.validate()?;
        if !(self.graph_weight >= 0.0) {
            return Err(GraphRagError::InvalidConfig(
                "graph_weight must be non-negative".to_string(),
            ));
        }
        if !(self.name_match_score > 0.0) {
            return Err(GraphRagError::InvalidConfig(
                "name_match_score must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalOutcome {
    pub items: Vec<EvidenceItem>,
    pub coverage: Coverage,
}

pub struct HybridRetriever {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    normalizer: EntityNormalizer,
    config: RetrieverConfig,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        config: RetrieverConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            embedder,
            vectors,
            graph,
            normalizer: EntityNormalizer::new(),
            config,
        })
    }

    /// Top-`k` evidence for `query`, expanding the graph `depth` hops from the seeds.
    ///
    /// Fails only when every source the mode asks for is unavailable; otherwise the
    /// missing source is reported in the outcome's coverage.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        depth: usize,
        mode: QueryMode,
    ) -> Result<RetrievalOutcome> {
        if mode == QueryMode::Raw || k == 0 {
            return Ok(RetrievalOutcome {
                items: Vec::new(),
                coverage: Coverage::Full,
            });
        }

        let (vector_result, names_result) = tokio::join!(
            async {
                if mode.uses_vector() {
                    self.vector_search(query, k).await
                } else {
                    Ok(Vec::new())
                }
            },
            async {
                if mode.uses_graph() {
                    self.match_names(query).await
                } else {
                    Ok(Vec::new())
                }
            },
        );

        let mut missing = Vec::new();
        let mut errors = Vec::new();

        let hits = vector_result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Vector retrieval failed, continuing without it");
            missing.push(RetrievalMethod::Vector);
            errors.push(e.to_string());
            Vec::new()
        });

        let mut graph_items = Vec::new();
        if mode.uses_graph() {
            let graph_result = match names_result {
                Ok(names) => self.expand(self.seeds(&hits, &names), depth).await,
                Err(e) => Err(e),
            };
            match graph_result {
                Ok(items) => graph_items = items,
                Err(e) => {
                    tracing::warn!(error = %e, "Graph retrieval failed, continuing without it");
                    missing.push(RetrievalMethod::Graph);
                    errors.push(e.to_string());
                }
            }
        }

        let requested = usize::from(mode.uses_vector()) + usize::from(mode.uses_graph());
        if missing.len() == requested {
            return Err(GraphRagError::RetrievalError(format!(
                "no retrieval source available: {}",
                errors.join("; ")
            )));
        }

        let mut merged: BTreeMap<String, EvidenceItem> = BTreeMap::new();
        for item in hits.iter().filter_map(vector_item).chain(graph_items) {
            match merged.get_mut(&item.object_id) {
                Some(existing) => existing.absorb(item),
                None => {
                    merged.insert(item.object_id.clone(), item);
                }
            }
        }
        let mut items: Vec<EvidenceItem> = merged.into_values().collect();
        items.sort_by(self.ordering());
        items.truncate(k);

        tracing::debug!(
            vector_hits = hits.len(),
            items = items.len(),
            degraded = !missing.is_empty(),
            "Retrieved evidence"
        );

        Ok(RetrievalOutcome {
            items,
            coverage: if missing.is_empty() {
                Coverage::Full
            } else {
                Coverage::Degraded { missing }
            },
        })
    }

    fn ordering(&self) -> fn(&EvidenceItem, &EvidenceItem) -> Ordering {
        if self.config.near_neighbor_first {
            rank_near_first
        } else {
            rank
        }
    }

    async fn vector_search(&self, query: &str, k: usize) -> Result<Vec<VectorHit>> {
        let vector = self.embedder.embed(query).await?;
        self.vectors
            .search(&vector, k, self.config.vector_score_threshold)
            .await
    }

    async fn match_names(&self, query: &str) -> Result<Vec<EntityKey>> {
        let keywords = query_keywords(&self.normalizer, query);
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        self.graph.find_by_names(&keywords).await
    }

    /// Seed scores: the best vector hit mentioning the entity, or the name-match score.
    fn seeds(&self, hits: &[VectorHit], names: &[EntityKey]) -> BTreeMap<EntityKey, f32> {
        let mut seeds: BTreeMap<EntityKey, f32> = BTreeMap::new();
        let mut offer = |key: EntityKey, score: f32| {
            let entry = seeds.entry(key).or_insert(score);
            *entry = entry.max(score);
        };
        for hit in hits {
            for key in hit.payload.entity_keys() {
                offer(key, hit.score);
            }
        }
        for key in names {
            offer(key.clone(), self.config.name_match_score);
        }
        seeds
    }

    async fn expand(
        &self,
        seeds: BTreeMap<EntityKey, f32>,
        depth: usize,
    ) -> Result<Vec<EvidenceItem>> {
        if seeds.is_empty() {
            return Ok(Vec::new());
        }
        let seed_keys: Vec<EntityKey> = seeds.keys().cloned().collect();
        let subgraph = self.graph.traverse(&seed_keys, depth).await?;

        let mut graph: UnGraph<EntityKey, ()> = UnGraph::new_undirected();
        let nodes: BTreeMap<EntityKey, NodeIndex> = subgraph
            .entities
            .keys()
            .map(|key| (key.clone(), graph.add_node(key.clone())))
            .collect();
        for relation in subgraph.relations.values() {
            if let (Some(&a), Some(&b)) = (nodes.get(&relation.subject), nodes.get(&relation.object)) {
                graph.add_edge(a, b, ());
            }
        }

        // Best (score, hops) per object across all seeds
        let mut entity_scores: BTreeMap<&EntityKey, (f32, usize)> = BTreeMap::new();
        let mut relation_scores: BTreeMap<&RelationId, (f32, usize)> = BTreeMap::new();

        for (seed, &seed_score) in &seeds {
            let Some(&start) = nodes.get(seed) else {
                continue;
            };
            let distances: HashMap<NodeIndex, usize> = dijkstra(&graph, start, None, |_| 1usize);
            let hops_to = |key: &EntityKey| nodes.get(key).and_then(|n| distances.get(n)).copied();

            for key in nodes.keys() {
                if let Some(hops) = hops_to(key).filter(|&h| h <= depth) {
                    offer_score(&mut entity_scores, key, seed_score * self.config.decay.apply(hops), hops);
                }
            }
            for (id, relation) in &subgraph.relations {
                let nearest = [hops_to(&relation.subject), hops_to(&relation.object)]
                    .into_iter()
                    .flatten()
                    .min();
                if let Some(hops) = nearest.map(|h| h + 1).filter(|&h| h <= depth) {
                    offer_score(&mut relation_scores, id, seed_score * self.config.decay.apply(hops), hops);
                }
            }
        }

        let weight = self.config.graph_weight;
        let mut items: Vec<EvidenceItem> = Vec::new();
        for (key, (score, hops)) in entity_scores {
            let Some(entity) = subgraph.entities.get(key) else {
                continue;
            };
            items.push(EvidenceItem {
                object_id: VectorRecord::entity_id(key),
                reference: EvidenceRef::Entity { key: key.clone() },
                score: score * weight,
                methods: BTreeSet::from([RetrievalMethod::Graph]),
                text: entity.text_representation(),
                hops: Some(hops),
            });
        }
        for (id, (score, hops)) in relation_scores {
            let Some(relation) = subgraph.relations.get(id) else {
                continue;
            };
            items.push(EvidenceItem {
                object_id: EvidenceItem::relation_object_id(id),
                reference: EvidenceRef::Relation { id: id.clone() },
                score: score * weight,
                methods: BTreeSet::from([RetrievalMethod::Graph]),
                text: relation.describe(&subgraph.entities),
                hops: Some(hops),
            });
        }

        items.retain(|item| item.score > 0.0);
        items.sort_by(self.ordering());
        items.truncate(self.config.max_graph_items);
        Ok(items)
    }
}

/// Keep the higher score; on equal scores keep the shorter path.
fn offer_score<'a, K: Ord>(scores: &mut BTreeMap<&'a K, (f32, usize)>, key: &'a K, score: f32, hops: usize) {
    scores
        .entry(key)
        .and_modify(|best| {
            if score > best.0 || (score == best.0 && hops < best.1) {
                *best = (score, hops);
            }
        })
        .or_insert((score, hops));
}

fn vector_item(hit: &VectorHit) -> Option<EvidenceItem> {
    let reference = match hit.payload.kind {
        RecordKind::Chunk => EvidenceRef::Chunk {
            chunk_id: hit.id.strip_prefix("chunk:").unwrap_or(&hit.id).to_string(),
        },
        RecordKind::Entity => EvidenceRef::Entity {
            key: hit.payload.entity_keys().into_iter().next()?,
        },
    };
    Some(EvidenceItem {
        object_id: hit.id.clone(),
        reference,
        score: hit.score,
        methods: BTreeSet::from([RetrievalMethod::Vector]),
        text: hit.payload.text.clone(),
        hops: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use index::{EdgeAttrs, Entity, GraphStats, MemoryGraphStore, MemoryVectorStore, Relation, RecordPayload, VertexAttrs};
    use pretty_assertions::assert_eq;

    const VOCABULARY: [&str; 4] = ["alice", "acme", "springfield", "bob"];

    /// One dimension per vocabulary word plus a constant bias dimension.
    struct VocabularyEmbedder;

    #[async_trait]
    impl Embedder for VocabularyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let text = text.to_lowercase();
            let mut vector: Vec<f32> = VOCABULARY
                .iter()
                .map(|w| if text.contains(w) { 1.0 } else { 0.0 })
                .collect();
            vector.push(0.1);
            Ok(vector)
        }

        fn model_name(&self) -> &str {
            "vocabulary"
        }
    }

    struct UnreachableGraph;

    #[async_trait]
    impl GraphStore for UnreachableGraph {
        async fn upsert_vertex(&self, _: &EntityKey, _: &VertexAttrs) -> Result<String> {
            Err(GraphRagError::GraphWriteError("down".into()))
        }
        async fn upsert_edge(&self, _: &EntityKey, _: &str, _: &EntityKey, _: &EdgeAttrs) -> Result<String> {
            Err(GraphRagError::GraphWriteError("down".into()))
        }
        async fn get_entities(&self, _: &[EntityKey]) -> Result<Vec<Entity>> {
            Err(GraphRagError::RetrievalError("graph unreachable".into()))
        }
        async fn incident_relations(&self, _: &[EntityKey]) -> Result<Vec<Relation>> {
            Err(GraphRagError::RetrievalError("graph unreachable".into()))
        }
        async fn find_by_names(&self, _: &[String]) -> Result<Vec<EntityKey>> {
            Err(GraphRagError::RetrievalError("graph unreachable".into()))
        }
        async fn stats(&self) -> Result<GraphStats> {
            Err(GraphRagError::RetrievalError("graph unreachable".into()))
        }
    }

    struct UnreachableVectors;

    #[async_trait]
    impl VectorStore for UnreachableVectors {
        async fn init(&self, _: usize) -> Result<()> {
            Ok(())
        }
        async fn upsert(&self, _: VectorRecord) -> Result<()> {
            Err(GraphRagError::VectorStoreError("down".into()))
        }
        async fn search(&self, _: &[f32], _: usize, _: Option<f32>) -> Result<Vec<VectorHit>> {
            Err(GraphRagError::RetrievalError("vector store unreachable".into()))
        }
        async fn count(&self) -> Result<usize> {
            Ok(0)
        }
    }

    fn key(name: &str, entity_type: &str) -> EntityKey {
        EntityKey {
            name: name.into(),
            entity_type: entity_type.into(),
        }
    }

    fn named(display: &str) -> VertexAttrs {
        VertexAttrs {
            display_name: display.into(),
            ..Default::default()
        }
    }

    async fn alice_graph() -> Arc<MemoryGraphStore> {
        let graph = Arc::new(MemoryGraphStore::new());
        graph.upsert_vertex(&key("alice", "person"), &named("Alice")).await.unwrap();
        graph.upsert_vertex(&key("acme", "organization"), &named("Acme")).await.unwrap();
        graph.upsert_vertex(&key("springfield", "location"), &named("Springfield")).await.unwrap();
        graph
            .upsert_edge(&key("alice", "person"), "works_at", &key("acme", "organization"), &EdgeAttrs::default())
            .await
            .unwrap();
        graph
            .upsert_edge(&key("acme", "organization"), "based_in", &key("springfield", "location"), &EdgeAttrs::default())
            .await
            .unwrap();
        graph
    }

    async fn alice_vectors() -> Arc<MemoryVectorStore> {
        let vectors = Arc::new(MemoryVectorStore::new());
        vectors.init(5).await.unwrap();
        let text = "Alice works at Acme.";
        vectors
            .upsert(VectorRecord {
                id: "chunk:c1".into(),
                vector: VocabularyEmbedder.embed(text).await.unwrap(),
                payload: RecordPayload {
                    kind: RecordKind::Chunk,
                    text: text.into(),
                    doc_id: Some("d1".into()),
                    source: Some("alice.txt".into()),
                    entity_keys: vec!["person:alice".into(), "organization:acme".into()],
                },
            })
            .await
            .unwrap();
        vectors
    }

    fn retriever(vectors: Arc<dyn VectorStore>, graph: Arc<dyn GraphStore>) -> HybridRetriever {
        HybridRetriever::new(Arc::new(VocabularyEmbedder), vectors, graph, RetrieverConfig::default()).unwrap()
    }

    #[test]
    fn test_decay_functions_are_non_increasing() {
        for decay in [
            HopDecay::Exponential { factor: 0.5 },
            HopDecay::Linear { step: 0.3 },
            HopDecay::Reciprocal,
        ] {
            assert_eq!(decay.apply(0), 1.0);
            for hops in 0..6 {
                assert!(decay.apply(hops + 1) <= decay.apply(hops));
            }
        }
        assert!(HopDecay::Exponential { factor: 1.5 }.validate().is_err());
    }

    #[tokio::test]
    async fn test_hybrid_reaches_two_hops() {
        let retriever = retriever(alice_vectors().await, alice_graph().await);

        let outcome = retriever
            .retrieve("Where is Alice's employer based?", 10, 2, QueryMode::Hybrid)
            .await
            .unwrap();

        assert_eq!(outcome.coverage, Coverage::Full);
        let ids: Vec<_> = outcome.items.iter().map(|i| i.object_id.as_str()).collect();
        assert!(ids.contains(&"chunk:c1"));
        assert!(ids.contains(&"entity:location:springfield"));
        assert!(ids.contains(&"relation:organization:acme|based_in|location:springfield"));

        let springfield = outcome
            .items
            .iter()
            .find(|i| i.object_id == "entity:location:springfield")
            .unwrap();
        assert_eq!(springfield.methods, BTreeSet::from([RetrievalMethod::Graph]));
        // Acme is a seed via the chunk, so Springfield is one hop away
        assert_eq!(springfield.hops, Some(1));
    }

    #[tokio::test]
    async fn test_results_are_sorted_and_deterministic() {
        let retriever = retriever(alice_vectors().await, alice_graph().await);
        let first = retriever.retrieve("Alice and Acme", 10, 2, QueryMode::Hybrid).await.unwrap();
        let second = retriever.retrieve("Alice and Acme", 10, 2, QueryMode::Hybrid).await.unwrap();

        assert_eq!(first, second);
        for pair in first.items.windows(2) {
            assert_ne!(rank(&pair[0], &pair[1]), std::cmp::Ordering::Greater);
        }
    }

    #[tokio::test]
    async fn test_graph_only_scores_name_matches() {
        let retriever = retriever(alice_vectors().await, alice_graph().await);
        let outcome = retriever.retrieve("Alice", 10, 1, QueryMode::GraphOnly).await.unwrap();

        let alice = outcome
            .items
            .iter()
            .find(|i| i.object_id == "entity:person:alice")
            .unwrap();
        assert_eq!(alice.score, 1.0);
        assert_eq!(alice.hops, Some(0));
        assert!(outcome.items.iter().all(|i| !i.methods.contains(&RetrievalMethod::Vector)));
    }

    #[tokio::test]
    async fn test_graph_down_degrades_to_vector_only() {
        let retriever = retriever(alice_vectors().await, Arc::new(UnreachableGraph));
        let outcome = retriever.retrieve("Alice", 5, 2, QueryMode::Hybrid).await.unwrap();

        assert_eq!(
            outcome.coverage,
            Coverage::Degraded {
                missing: vec![RetrievalMethod::Graph]
            }
        );
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].object_id, "chunk:c1");
    }

    #[tokio::test]
    async fn test_both_sources_down_is_a_retrieval_error() {
        let retriever = retriever(Arc::new(UnreachableVectors), Arc::new(UnreachableGraph));
        let err = retriever.retrieve("Alice", 5, 2, QueryMode::Hybrid).await.unwrap_err();
        assert!(matches!(err, GraphRagError::RetrievalError(_)));
    }

    #[tokio::test]
    async fn test_vector_only_ignores_graph_outage() {
        let retriever = retriever(alice_vectors().await, Arc::new(UnreachableGraph));
        let outcome = retriever.retrieve("Alice", 5, 2, QueryMode::VectorOnly).await.unwrap();
        assert_eq!(outcome.coverage, Coverage::Full);
    }

    #[tokio::test]
    async fn test_graph_items_are_capped() {
        let config = RetrieverConfig {
            max_graph_items: 1,
            ..Default::default()
        };
        let retriever = HybridRetriever::new(
            Arc::new(VocabularyEmbedder),
            alice_vectors().await,
            alice_graph().await,
            config,
        )
        .unwrap();

        let outcome = retriever.retrieve("Springfield", 10, 2, QueryMode::GraphOnly).await.unwrap();
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.items[0].object_id, "entity:location:springfield");
    }

    #[tokio::test]
    async fn test_near_neighbors_rank_first() {
        // No decay, so every graph item ties on score
        let flat = RetrieverConfig {
            decay: HopDecay::Linear { step: 0.0 },
            ..Default::default()
        };
        let by_score = HybridRetriever::new(
            Arc::new(VocabularyEmbedder),
            alice_vectors().await,
            alice_graph().await,
            flat.clone(),
        )
        .unwrap();
        let outcome = by_score.retrieve("Alice", 10, 2, QueryMode::GraphOnly).await.unwrap();
        assert_eq!(outcome.items[0].object_id, "entity:location:springfield");
        assert_eq!(outcome.items[0].hops, Some(2));

        let near_first = HybridRetriever::new(
            Arc::new(VocabularyEmbedder),
            alice_vectors().await,
            alice_graph().await,
            RetrieverConfig {
                near_neighbor_first: true,
                ..flat
            },
        )
        .unwrap();
        let outcome = near_first.retrieve("Alice", 10, 2, QueryMode::GraphOnly).await.unwrap();

        let ids: Vec<_> = outcome.items.iter().map(|i| i.object_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "entity:person:alice",
                "entity:organization:acme",
                "relation:person:alice|works_at|organization:acme",
                "entity:location:springfield",
                "relation:organization:acme|based_in|location:springfield",
            ]
        );
        let hops: Vec<_> = outcome.items.iter().map(|i| i.hops).collect();
        assert_eq!(hops, vec![Some(0), Some(1), Some(1), Some(2), Some(2)]);
    }
}
