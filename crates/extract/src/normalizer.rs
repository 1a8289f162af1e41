use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identity of an entity: normalized name plus normalized type.
///
/// Two extractions that normalize to the same key are the same entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub name: String,
    pub entity_type: String,
}

impl EntityKey {
    /// Rendered form used as vertex id and in vector payloads: `type:name`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.entity_type, self.name)
    }

    pub fn parse(id: &str) -> Option<Self> {
        let (entity_type, name) = id.split_once(':')?;
        if entity_type.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
        })
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.name)
    }
}

const EDGE_PUNCTUATION: &[char] = &[
    '.', ',', '!', '?', ';', ':', '\'', '"', '(', ')', '[', ']', '{', '}',
];

/// Pure, order-independent canonicalization of names, types and predicates.
#[derive(Debug, Clone)]
pub struct EntityNormalizer {
    whitespace: Regex,
    separators: Regex,
}

impl Default for EntityNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityNormalizer {
    pub fn new() -> Self {
        Self {
            whitespace: Regex::new(r"\s+").expect("static regex"),
            separators: Regex::new(r"[\s\-:]+").expect("static regex"),
        }
    }

    /// Lowercase, trim edge punctuation and collapse whitespace.
    pub fn normalize_name(&self, name: &str) -> String {
        self.display_name(name).to_lowercase()
    }

    /// Whitespace-collapsed original spelling, kept for presentation.
    pub fn display_name(&self, name: &str) -> String {
        let trimmed = name.trim().trim_matches(EDGE_PUNCTUATION).trim();
        self.whitespace.replace_all(trimmed, " ").to_string()
    }

    /// Types and predicates share the snake_case form: `Works At` -> `works_at`.
    pub fn normalize_label(&self, label: &str) -> String {
        let lowered = label.trim().trim_matches(EDGE_PUNCTUATION).to_lowercase();
        self.separators
            .replace_all(lowered.trim(), "_")
            .trim_matches('_')
            .to_string()
    }

    /// Returns `None` when either part is empty after normalization.
    pub fn key(&self, name: &str, entity_type: &str) -> Option<EntityKey> {
        let name = self.normalize_name(name);
        let entity_type = self.normalize_label(entity_type);
        if name.is_empty() || entity_type.is_empty() {
            return None;
        }
        Some(EntityKey { name, entity_type })
    }
}
