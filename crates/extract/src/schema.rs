use serde::{Deserialize, Serialize};

use crate::normalizer::{EntityKey, EntityNormalizer};

/// Entity types suggested to the model when the schema leaves types open.
pub const SUGGESTED_ENTITY_TYPES: [&str; 6] = [
    "PERSON",
    "ORGANIZATION",
    "LOCATION",
    "CONCEPT",
    "TECHNOLOGY",
    "EVENT",
];

/// Allowed entity types and relation predicates. An empty list leaves that side open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub predicates: Vec<String>,
}

impl ExtractionSchema {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn new<T, P>(entity_types: T, predicates: P) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            entity_types: entity_types.into_iter().map(Into::into).collect(),
            predicates: predicates.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows_type(&self, normalizer: &EntityNormalizer, entity_type: &str) -> bool {
        self.entity_types.is_empty()
            || self
                .entity_types
                .iter()
                .any(|t| normalizer.normalize_label(t) == entity_type)
    }

    pub fn allows_predicate(&self, normalizer: &EntityNormalizer, predicate: &str) -> bool {
        self.predicates.is_empty()
            || self
                .predicates
                .iter()
                .any(|p| normalizer.normalize_label(p) == predicate)
    }
}

/// An entity as observed in a single chunk, before merging into the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStub {
    pub key: EntityKey,
    pub display_name: String,
    pub summary: Option<String>,
    pub source_chunk_id: String,
    pub confidence: Option<f32>,
}

/// A directed relation as observed in a single chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationStub {
    pub subject: EntityKey,
    pub predicate: String,
    pub object: EntityKey,
    pub source_chunk_id: String,
    pub evidence: Option<String>,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entities: Vec<EntityStub>,
    pub relations: Vec<RelationStub>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub extraction: ExtractionResult,
}

/// Wire shape the model is asked to produce, parsed item by item.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawRelation {
    pub source: String,
    pub target: String,
    pub relation: String,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_schema_allows_everything() {
        let normalizer = EntityNormalizer::new();
        let schema = ExtractionSchema::open();
        assert!(schema.allows_type(&normalizer, "spaceship"));
        assert!(schema.allows_predicate(&normalizer, "orbits"));
    }

    #[test]
    fn test_closed_schema_compares_normalized_labels() {
        let normalizer = EntityNormalizer::new();
        let schema = ExtractionSchema::new(["Person", "Organization"], ["Works At"]);
        assert!(schema.allows_type(&normalizer, "person"));
        assert!(!schema.allows_type(&normalizer, "location"));
        assert!(schema.allows_predicate(&normalizer, "works_at"));
        assert!(!schema.allows_predicate(&normalizer, "based_in"));
    }
}
