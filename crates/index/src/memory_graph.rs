use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};

use crate::graph::{EdgeAttrs, Entity, GraphStats, GraphStore, Relation, RelationId, VertexAttrs};
use common::{GraphRagError, Result};
use extract::EntityKey;

/// In-process graph store. Each map entry is locked independently, which gives the same
/// per-key atomicity a graph database provides for MERGE.
#[derive(Default)]
pub struct MemoryGraphStore {
    entities: DashMap<EntityKey, Entity>,
    relations: DashMap<RelationId, Relation>,
    adjacency: DashMap<EntityKey, BTreeSet<RelationId>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entities sorted by key.
    pub fn entities(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self.entities.iter().map(|e| e.value().clone()).collect();
        entities.sort_by(|a, b| a.key.cmp(&b.key));
        entities
    }

    /// All relations sorted by identity.
    pub fn relations(&self) -> Vec<Relation> {
        let mut relations: Vec<Relation> =
            self.relations.iter().map(|r| r.value().clone()).collect();
        relations.sort_by_key(|r| r.relation_id());
        relations
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_vertex(&self, key: &EntityKey, attrs: &VertexAttrs) -> Result<String> {
        self.entities
            .entry(key.clone())
            .and_modify(|entity| entity.attrs.merge(attrs))
            .or_insert_with(|| Entity {
                key: key.clone(),
                attrs: attrs.clone(),
            });
        Ok(key.id())
    }

    async fn upsert_edge(
        &self,
        subject: &EntityKey,
        predicate: &str,
        object: &EntityKey,
        attrs: &EdgeAttrs,
    ) -> Result<String> {
        for endpoint in [subject, object] {
            if !self.entities.contains_key(endpoint) {
                return Err(GraphRagError::GraphWriteError(format!(
                    "edge endpoint {} does not exist",
                    endpoint
                )));
            }
        }

        let relation_id = RelationId {
            subject: subject.clone(),
            predicate: predicate.to_string(),
            object: object.clone(),
        };
        self.relations
            .entry(relation_id.clone())
            .and_modify(|relation| relation.attrs.merge(attrs))
            .or_insert_with(|| Relation {
                subject: subject.clone(),
                predicate: predicate.to_string(),
                object: object.clone(),
                attrs: attrs.clone(),
            });
        for endpoint in [subject, object] {
            self.adjacency
                .entry(endpoint.clone())
                .or_default()
                .insert(relation_id.clone());
        }

        Ok(relation_id.id())
    }

    async fn get_entities(&self, keys: &[EntityKey]) -> Result<Vec<Entity>> {
        Ok(keys
            .iter()
            .filter_map(|key| self.entities.get(key).map(|e| e.value().clone()))
            .collect())
    }

    async fn incident_relations(&self, keys: &[EntityKey]) -> Result<Vec<Relation>> {
        let mut ids = BTreeSet::new();
        for key in keys {
            if let Some(adjacent) = self.adjacency.get(key) {
                ids.extend(adjacent.value().iter().cloned());
            }
        }
        Ok(ids
            .iter()
            .filter_map(|id| self.relations.get(id).map(|r| r.value().clone()))
            .collect())
    }

    async fn find_by_names(&self, names: &[String]) -> Result<Vec<EntityKey>> {
        let names: HashSet<&str> = names.iter().map(String::as_str).collect();
        let mut keys: Vec<EntityKey> = self
            .entities
            .iter()
            .filter(|e| names.contains(e.key().name.as_str()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn stats(&self) -> Result<GraphStats> {
        Ok(GraphStats {
            entity_count: self.entities.len(),
            relation_count: self.relations.len(),
        })
    }
}
