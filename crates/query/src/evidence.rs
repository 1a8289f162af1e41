use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use extract::EntityKey;
use index::RelationId;

/// What a piece of evidence points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceRef {
    Chunk { chunk_id: String },
    Entity { key: EntityKey },
    Relation { id: RelationId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    Vector,
    Graph,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// `chunk:<id>`, `entity:<type:name>` or `relation:<s|p|o>`; unique per evidence item.
    pub object_id: String,
    pub reference: EvidenceRef,
    pub score: f32,
    pub methods: BTreeSet<RetrievalMethod>,
    pub text: String,
    /// Hop distance from the nearest scoring seed, for graph items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hops: Option<usize>,
}

impl EvidenceItem {
    pub fn relation_object_id(id: &RelationId) -> String {
        format!("relation:{}", id.id())
    }

    /// Fold a duplicate observation of the same object into this one.
    pub fn absorb(&mut self, other: EvidenceItem) {
        if other.score > self.score {
            self.score = other.score;
        }
        self.methods.extend(other.methods);
        self.hops = match (self.hops, other.hops) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Score descending, then object id ascending.
pub fn rank(a: &EvidenceItem, b: &EvidenceItem) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.object_id.cmp(&b.object_id))
}

/// Hop distance first, then [`rank`]. Direct hits without a graph path count as zero hops.
pub fn rank_near_first(a: &EvidenceItem, b: &EvidenceItem) -> Ordering {
    a.hops
        .unwrap_or(0)
        .cmp(&b.hops.unwrap_or(0))
        .then_with(|| rank(a, b))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Coverage {
    Full,
    Degraded { missing: Vec<RetrievalMethod> },
}

impl Coverage {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Coverage::Degraded { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Plain model answer without retrieval.
    Raw,
    VectorOnly,
    GraphOnly,
    #[default]
    Hybrid,
}

impl QueryMode {
    pub fn uses_vector(self) -> bool {
        matches!(self, QueryMode::VectorOnly | QueryMode::Hybrid)
    }

    pub fn uses_graph(self) -> bool {
        matches!(self, QueryMode::GraphOnly | QueryMode::Hybrid)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetReport {
    pub budget: usize,
    pub used: usize,
    pub included: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<EvidenceItem>,
    pub budget: BudgetReport,
    pub coverage: Coverage,
    pub mode: QueryMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, score: f32, method: RetrievalMethod, hops: Option<usize>) -> EvidenceItem {
        EvidenceItem {
            object_id: id.into(),
            reference: EvidenceRef::Chunk { chunk_id: id.into() },
            score,
            methods: BTreeSet::from([method]),
            text: String::new(),
            hops,
        }
    }

    #[test]
    fn test_rank_breaks_ties_by_object_id() {
        let mut items = vec![
            item("b", 0.5, RetrievalMethod::Vector, None),
            item("c", 0.9, RetrievalMethod::Vector, None),
            item("a", 0.5, RetrievalMethod::Vector, None),
        ];
        items.sort_by(rank);
        let ids: Vec<_> = items.iter().map(|i| i.object_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_absorb_keeps_best_score_and_all_methods() {
        let mut a = item("x", 0.4, RetrievalMethod::Vector, None);
        a.absorb(item("x", 0.7, RetrievalMethod::Graph, Some(1)));
        assert_eq!(a.score, 0.7);
        assert_eq!(a.methods.len(), 2);
        assert_eq!(a.hops, Some(1));
    }

    #[test]
    fn test_query_mode_serializes_snake_case() {
        let mode: QueryMode = serde_json::from_str("\"vector_only\"").unwrap();
        assert_eq!(mode, QueryMode::VectorOnly);
        assert!(!mode.uses_graph());
        assert_eq!(QueryMode::default(), QueryMode::Hybrid);
    }
}
