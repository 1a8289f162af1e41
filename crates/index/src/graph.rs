//! Property-graph model and the store interface the pipeline writes through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use common::Result;
use extract::EntityKey;

/// Mergeable vertex attributes. Every field merges with a commutative, idempotent rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VertexAttrs {
    /// Empty when the vertex was only seen as a relation endpoint.
    pub display_name: String,
    pub source_chunk_ids: BTreeSet<String>,
    pub summaries: BTreeSet<String>,
}

impl VertexAttrs {
    pub fn merge(&mut self, other: &VertexAttrs) {
        self.display_name = merge_display_name(&self.display_name, &other.display_name);
        self.source_chunk_ids
            .extend(other.source_chunk_ids.iter().cloned());
        self.summaries.extend(other.summaries.iter().cloned());
    }
}

/// Smallest non-empty spelling wins, so the outcome doesn't depend on merge order.
pub fn merge_display_name(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => a.min(b).to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeAttrs {
    pub source_chunk_ids: BTreeSet<String>,
    pub evidence: BTreeSet<String>,
    pub confidence: Option<f32>,
}

impl EdgeAttrs {
    pub fn merge(&mut self, other: &EdgeAttrs) {
        self.source_chunk_ids
            .extend(other.source_chunk_ids.iter().cloned());
        self.evidence.extend(other.evidence.iter().cloned());
        self.confidence = match (self.confidence, other.confidence) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub attrs: VertexAttrs,
}

impl Entity {
    pub fn display_name(&self) -> &str {
        if self.attrs.display_name.is_empty() {
            &self.key.name
        } else {
            &self.attrs.display_name
        }
    }

    /// Text embedded for the entity's vector record: name, type and summaries.
    pub fn text_representation(&self) -> String {
        let mut text = format!("{} ({})", self.display_name(), self.key.entity_type);
        if !self.attrs.summaries.is_empty() {
            text.push_str(": ");
            text.push_str(
                &self
                    .attrs
                    .summaries
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join("; "),
            );
        }
        text
    }
}

/// Identity of a relation: one edge per (subject, predicate, object).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationId {
    pub subject: EntityKey,
    pub predicate: String,
    pub object: EntityKey,
}

impl RelationId {
    pub fn id(&self) -> String {
        format!("{}|{}|{}", self.subject.id(), self.predicate, self.object.id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub subject: EntityKey,
    pub predicate: String,
    pub object: EntityKey,
    pub attrs: EdgeAttrs,
}

impl Relation {
    pub fn relation_id(&self) -> RelationId {
        RelationId {
            subject: self.subject.clone(),
            predicate: self.predicate.clone(),
            object: self.object.clone(),
        }
    }

    pub fn describe(&self, entities: &BTreeMap<EntityKey, Entity>) -> String {
        let name = |key: &EntityKey| {
            entities
                .get(key)
                .map(|e| e.display_name().to_string())
                .unwrap_or_else(|| key.name.clone())
        };
        let mut text = format!(
            "{} {} {}",
            name(&self.subject),
            self.predicate,
            name(&self.object)
        );
        if let Some(evidence) = self.attrs.evidence.iter().next() {
            text.push_str(&format!(" (Evidence: {})", evidence));
        }
        text
    }
}

/// Entities and relations reached from a set of seeds, with each entity's hop distance
/// from the nearest seed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subgraph {
    pub entities: BTreeMap<EntityKey, Entity>,
    pub relations: BTreeMap<RelationId, Relation>,
    pub hops: BTreeMap<EntityKey, usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub entity_count: usize,
    pub relation_count: usize,
}

/// Query/mutation interface to the graph database.
///
/// Writes fail with `GraphWriteError`; reads fail with `RetrievalError`. Upserts must be
/// atomic per key on the store side; the pipeline relies on that instead of locking.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Create the vertex or merge `attrs` into it. Returns the vertex id.
    async fn upsert_vertex(&self, key: &EntityKey, attrs: &VertexAttrs) -> Result<String>;

    /// Create the edge or merge `attrs` into it. Both endpoints must already exist.
    async fn upsert_edge(
        &self,
        subject: &EntityKey,
        predicate: &str,
        object: &EntityKey,
        attrs: &EdgeAttrs,
    ) -> Result<String>;

    /// Entities for the given keys; unknown keys are skipped.
    async fn get_entities(&self, keys: &[EntityKey]) -> Result<Vec<Entity>>;

    /// Relations with either endpoint in `keys`.
    async fn incident_relations(&self, keys: &[EntityKey]) -> Result<Vec<Relation>>;

    /// Keys of entities whose normalized name is in `names`.
    async fn find_by_names(&self, names: &[String]) -> Result<Vec<EntityKey>>;

    async fn stats(&self) -> Result<GraphStats>;

    /// Breadth-first expansion from `seeds` following relations in both directions, up to
    /// `depth` hops.
    async fn traverse(&self, seeds: &[EntityKey], depth: usize) -> Result<Subgraph> {
        let mut hops: BTreeMap<EntityKey, usize> =
            seeds.iter().map(|seed| (seed.clone(), 0)).collect();
        let mut frontier: Vec<EntityKey> = hops.keys().cloned().collect();
        let mut relations = BTreeMap::new();

        for hop in 1..=depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = BTreeSet::new();
            for relation in self.incident_relations(&frontier).await? {
                for endpoint in [&relation.subject, &relation.object] {
                    if !hops.contains_key(endpoint) {
                        hops.insert(endpoint.clone(), hop);
                        next.insert(endpoint.clone());
                    }
                }
                relations.entry(relation.relation_id()).or_insert(relation);
            }
            frontier = next.into_iter().collect();
        }

        let keys: Vec<EntityKey> = hops.keys().cloned().collect();
        let entities: BTreeMap<EntityKey, Entity> = self
            .get_entities(&keys)
            .await?
            .into_iter()
            .map(|entity| (entity.key.clone(), entity))
            .collect();
        hops.retain(|key, _| entities.contains_key(key));

        Ok(Subgraph {
            entities,
            relations,
            hops,
        })
    }
}
