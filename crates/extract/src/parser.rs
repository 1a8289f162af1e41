//! Boundary between untrusted model text and typed extraction results.
//!
//! Every entity and relation in the model output is parsed on its own into a
//! [`ParsedItem`]. A chunk only yields an [`ExtractionResult`] when no item failed.

use serde_json::Value;
use std::collections::HashMap;

use crate::normalizer::{EntityKey, EntityNormalizer};
use crate::schema::{EntityStub, ExtractionResult, ExtractionSchema, RawEntity, RawRelation, RelationStub};
use common::{GraphRagError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedItem {
    Entity(EntityStub),
    Triple(RelationStub),
    Failure(ParseFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseFailure {
    /// Location in the model output, e.g. `relations[2]`.
    pub item: String,
    pub reason: String,
}

impl ParseFailure {
    fn new(item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            reason: reason.into(),
        }
    }
}

pub struct ExtractionParser<'a> {
    schema: &'a ExtractionSchema,
    normalizer: &'a EntityNormalizer,
}

impl<'a> ExtractionParser<'a> {
    pub fn new(schema: &'a ExtractionSchema, normalizer: &'a EntityNormalizer) -> Self {
        Self { schema, normalizer }
    }

    pub fn parse(&self, raw: &str, chunk_id: &str) -> Vec<ParsedItem> {
        let document = match parse_json_object(raw) {
            Ok(value) => value,
            Err(reason) => return vec![ParsedItem::Failure(ParseFailure::new("$", reason))],
        };

        let entities = match document.get("entities") {
            Some(Value::Array(items)) => items.as_slice(),
            Some(_) => {
                return vec![ParsedItem::Failure(ParseFailure::new(
                    "entities",
                    "expected an array",
                ))];
            }
            None => &[],
        };
        let relations = match document.get("relations") {
            Some(Value::Array(items)) => items.as_slice(),
            Some(_) => {
                return vec![ParsedItem::Failure(ParseFailure::new(
                    "relations",
                    "expected an array",
                ))];
            }
            None => &[],
        };

        let mut items = Vec::with_capacity(entities.len() + relations.len());
        // Relation endpoints may reference an entity by its local id or by name.
        let mut references: HashMap<String, EntityKey> = HashMap::new();

        for (i, value) in entities.iter().enumerate() {
            let item = self.parse_entity(value, chunk_id, &format!("entities[{}]", i));
            if let ParsedItem::Entity(stub) = &item {
                if let Some(id) = value.get("id").and_then(Value::as_str) {
                    references.insert(id.trim().to_string(), stub.key.clone());
                }
                references.insert(stub.key.name.clone(), stub.key.clone());
            }
            items.push(item);
        }

        for (i, value) in relations.iter().enumerate() {
            items.push(self.parse_relation(value, chunk_id, &references, &format!("relations[{}]", i)));
        }

        items
    }

    fn parse_entity(&self, value: &Value, chunk_id: &str, location: &str) -> ParsedItem {
        let raw: RawEntity = match serde_json::from_value(value.clone()) {
            Ok(raw) => raw,
            Err(e) => return ParsedItem::Failure(ParseFailure::new(location, e.to_string())),
        };

        let Some(key) = self.normalizer.key(&raw.name, &raw.entity_type) else {
            return ParsedItem::Failure(ParseFailure::new(location, "empty name or type"));
        };
        if !self.schema.allows_type(self.normalizer, &key.entity_type) {
            return ParsedItem::Failure(ParseFailure::new(
                location,
                format!("entity type '{}' is not in the schema", key.entity_type),
            ));
        }
        if let Err(reason) = check_confidence(raw.confidence) {
            return ParsedItem::Failure(ParseFailure::new(location, reason));
        }

        ParsedItem::Entity(EntityStub {
            display_name: self.normalizer.display_name(&raw.name),
            key,
            summary: raw
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            source_chunk_id: chunk_id.to_string(),
            confidence: raw.confidence,
        })
    }

    fn parse_relation(
        &self,
        value: &Value,
        chunk_id: &str,
        references: &HashMap<String, EntityKey>,
        location: &str,
    ) -> ParsedItem {
        let raw: RawRelation = match serde_json::from_value(value.clone()) {
            Ok(raw) => raw,
            Err(e) => return ParsedItem::Failure(ParseFailure::new(location, e.to_string())),
        };

        let resolve = |reference: &str| {
            references
                .get(reference.trim())
                .or_else(|| references.get(&self.normalizer.normalize_name(reference)))
                .cloned()
        };
        let (Some(subject), Some(object)) = (resolve(&raw.source), resolve(&raw.target)) else {
            return ParsedItem::Failure(ParseFailure::new(
                location,
                format!(
                    "unknown entity reference in ({}, {})",
                    raw.source, raw.target
                ),
            ));
        };

        let predicate = self.normalizer.normalize_label(&raw.relation);
        if predicate.is_empty() {
            return ParsedItem::Failure(ParseFailure::new(location, "empty predicate"));
        }
        if !self.schema.allows_predicate(self.normalizer, &predicate) {
            return ParsedItem::Failure(ParseFailure::new(
                location,
                format!("predicate '{}' is not in the schema", predicate),
            ));
        }
        if let Err(reason) = check_confidence(raw.confidence) {
            return ParsedItem::Failure(ParseFailure::new(location, reason));
        }

        ParsedItem::Triple(RelationStub {
            subject,
            predicate,
            object,
            source_chunk_id: chunk_id.to_string(),
            evidence: raw
                .evidence
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
            confidence: raw.confidence,
        })
    }
}

/// Collect parsed items into a result, failing the whole chunk on any failure.
pub fn into_result(items: Vec<ParsedItem>) -> Result<ExtractionResult> {
    let mut result = ExtractionResult::default();
    let mut failures = Vec::new();

    for item in items {
        match item {
            ParsedItem::Entity(stub) => result.entities.push(stub),
            ParsedItem::Triple(stub) => result.relations.push(stub),
            ParsedItem::Failure(failure) => {
                failures.push(format!("{}: {}", failure.item, failure.reason))
            }
        }
    }

    if failures.is_empty() {
        Ok(result)
    } else {
        Err(GraphRagError::ExtractionParseError(failures.join("; ")))
    }
}

fn check_confidence(confidence: Option<f32>) -> std::result::Result<(), String> {
    match confidence {
        Some(c) if !(0.0..=1.0).contains(&c) => {
            Err(format!("confidence {} is outside [0, 1]", c))
        }
        _ => Ok(()),
    }
}

/// Models sometimes wrap JSON in prose or code fences; take the outermost object.
fn parse_json_object(raw: &str) -> std::result::Result<Value, String> {
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return Err("no JSON object in model output".to_string());
    };
    if end < start {
        return Err("no JSON object in model output".to_string());
    }
    serde_json::from_str(&raw[start..=end]).map_err(|e| format!("invalid JSON: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(raw: &str, schema: &ExtractionSchema) -> Vec<ParsedItem> {
        let normalizer = EntityNormalizer::new();
        ExtractionParser::new(schema, &normalizer).parse(raw, "chunk-1")
    }

    const ALICE: &str = r#"{
        "entities": [
            {"id": "E1", "name": "Alice", "type": "PERSON", "description": "An engineer"},
            {"id": "E2", "name": "Acme", "type": "ORGANIZATION", "confidence": 0.9},
            {"id": "E3", "name": "Springfield", "type": "LOCATION"}
        ],
        "relations": [
            {"source": "E1", "target": "E2", "relation": "works at", "evidence": "Alice works at Acme."},
            {"source": "Acme", "target": "springfield", "relation": "BASED_IN"}
        ]
    }"#;

    #[test]
    fn test_parses_entities_and_triples() {
        let result = into_result(parse(ALICE, &ExtractionSchema::open())).unwrap();

        let names: Vec<_> = result.entities.iter().map(|e| e.key.id()).collect();
        assert_eq!(
            names,
            vec!["person:alice", "organization:acme", "location:springfield"]
        );
        assert_eq!(result.entities[0].summary.as_deref(), Some("An engineer"));
        assert_eq!(result.entities[1].confidence, Some(0.9));

        let triples: Vec<_> = result
            .relations
            .iter()
            .map(|r| (r.subject.id(), r.predicate.clone(), r.object.id()))
            .collect();
        assert_eq!(
            triples,
            vec![
                ("person:alice".to_string(), "works_at".to_string(), "organization:acme".to_string()),
                ("organization:acme".to_string(), "based_in".to_string(), "location:springfield".to_string()),
            ]
        );
        assert!(result.relations.iter().all(|r| r.source_chunk_id == "chunk-1"));
    }

    #[test]
    fn test_tolerates_code_fences() {
        let raw = format!("```json\n{}\n```", ALICE);
        assert!(into_result(parse(&raw, &ExtractionSchema::open())).is_ok());
    }

    #[test]
    fn test_malformed_json_is_a_parse_error() {
        let items = parse("{\"entities\": [", &ExtractionSchema::open());
        assert!(matches!(items.as_slice(), [ParsedItem::Failure(_)]));
        assert!(matches!(
            into_result(items),
            Err(GraphRagError::ExtractionParseError(_))
        ));
    }

    #[test]
    fn test_schema_violation_fails_the_chunk() {
        let schema = ExtractionSchema::new(["person", "organization"], ["works_at", "based_in"]);
        let items = parse(ALICE, &schema);

        let failures: Vec<_> = items
            .iter()
            .filter_map(|i| match i {
                ParsedItem::Failure(f) => Some(f.item.clone()),
                _ => None,
            })
            .collect();
        // Springfield's type is rejected, so the relation pointing at it cannot resolve
        assert_eq!(failures, vec!["entities[2]", "relations[1]"]);

        let err = into_result(items).unwrap_err();
        assert!(err.to_string().contains("location"));
    }

    #[test]
    fn test_unknown_reference_and_bad_confidence_fail() {
        let raw = r#"{
            "entities": [{"id": "E1", "name": "Alice", "type": "PERSON", "confidence": 1.5}],
            "relations": [{"source": "E1", "target": "E9", "relation": "knows"}]
        }"#;
        let items = parse(raw, &ExtractionSchema::open());
        assert_eq!(
            items.iter().filter(|i| matches!(i, ParsedItem::Failure(_))).count(),
            2
        );
    }

    #[test]
    fn test_missing_sections_are_empty() {
        let result = into_result(parse("{}", &ExtractionSchema::open())).unwrap();
        assert!(result.is_empty());
    }
}
