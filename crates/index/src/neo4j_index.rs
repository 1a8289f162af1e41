use async_trait::async_trait;
use neo4rs::{Graph, Query, Row};

use crate::graph::{EdgeAttrs, Entity, GraphStats, GraphStore, Relation, VertexAttrs};
use common::{GraphRagError, Result};
use extract::EntityKey;

/// Graph store backed by Neo4j. Vertices are `:Entity` nodes keyed by `type:name`,
/// edges are `:RELATION` relationships carrying the predicate as a property.
pub struct Neo4jGraphStore {
    graph: Graph,
}

fn write_error(e: neo4rs::Error) -> GraphRagError {
    GraphRagError::GraphWriteError(e.to_string())
}

fn read_error(e: neo4rs::Error) -> GraphRagError {
    GraphRagError::RetrievalError(e.to_string())
}

impl Neo4jGraphStore {
    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }

    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let graph = Graph::new(uri, user, password)
            .await
            .map_err(|e| GraphRagError::InvalidConfig(format!("neo4j connection failed: {}", e)))?;
        Ok(Self::new(graph))
    }

    async fn fetch(&self, query: Query) -> Result<Vec<Row>> {
        let mut result = self.graph.execute(query).await.map_err(read_error)?;
        let mut rows = Vec::new();
        while let Some(row) = result.next().await.map_err(read_error)? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn count(&self, cypher: &str) -> Result<usize> {
        let rows = self.fetch(Query::new(cypher.to_string())).await?;
        Ok(rows
            .first()
            .map(|row| row.get::<i64>("count").unwrap_or_default() as usize)
            .unwrap_or(0))
    }
}

fn key_from_row(row: &Row, name: &str, entity_type: &str) -> EntityKey {
    EntityKey {
        name: row.get::<String>(name).unwrap_or_default(),
        entity_type: row.get::<String>(entity_type).unwrap_or_default(),
    }
}

fn string_set(row: &Row, column: &str) -> std::collections::BTreeSet<String> {
    row.get::<Vec<String>>(column)
        .unwrap_or_default()
        .into_iter()
        .collect()
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn init(&self) -> Result<()> {
        tracing::info!("Creating Neo4j constraints and indexes");

        let statements = [
            "CREATE CONSTRAINT entity_key_unique IF NOT EXISTS FOR (e:Entity) REQUIRE e.key IS UNIQUE",
            "CREATE INDEX entity_name_index IF NOT EXISTS FOR (e:Entity) ON (e.name)",
        ];
        for statement in statements {
            self.graph
                .run(Query::new(statement.to_string()))
                .await
                .map_err(write_error)?;
        }
        Ok(())
    }

    async fn upsert_vertex(&self, key: &EntityKey, attrs: &VertexAttrs) -> Result<String> {
        // The merge rules mirror VertexAttrs::merge so that concurrent writers converge
        let query = Query::new(
            r#"
            MERGE (e:Entity {key: $key})
            ON CREATE SET e.name = $name,
                e.type = $type,
                e.display_name = $display_name,
                e.source_chunk_ids = $source_chunk_ids,
                e.summaries = $summaries
            ON MATCH SET e.display_name = CASE
                    WHEN $display_name = '' THEN e.display_name
                    WHEN e.display_name = '' OR $display_name < e.display_name THEN $display_name
                    ELSE e.display_name
                END,
                e.source_chunk_ids = e.source_chunk_ids + [v IN $source_chunk_ids WHERE NOT v IN e.source_chunk_ids],
                e.summaries = e.summaries + [v IN $summaries WHERE NOT v IN e.summaries]
            "#
            .to_string(),
        )
        .param("key", key.id())
        .param("name", key.name.clone())
        .param("type", key.entity_type.clone())
        .param("display_name", attrs.display_name.clone())
        .param(
            "source_chunk_ids",
            attrs.source_chunk_ids.iter().cloned().collect::<Vec<_>>(),
        )
        .param("summaries", attrs.summaries.iter().cloned().collect::<Vec<_>>());

        self.graph.run(query).await.map_err(write_error)?;
        Ok(key.id())
    }

    async fn upsert_edge(
        &self,
        subject: &EntityKey,
        predicate: &str,
        object: &EntityKey,
        attrs: &EdgeAttrs,
    ) -> Result<String> {
        let query = Query::new(
            r#"
            MATCH (s:Entity {key: $subject})
            MATCH (o:Entity {key: $object})
            MERGE (s)-[r:RELATION {predicate: $predicate}]->(o)
            ON CREATE SET r.source_chunk_ids = $source_chunk_ids,
                r.evidence = $evidence,
                r.confidence = CASE WHEN $has_confidence THEN $confidence ELSE null END
            ON MATCH SET r.source_chunk_ids = r.source_chunk_ids + [v IN $source_chunk_ids WHERE NOT v IN r.source_chunk_ids],
                r.evidence = r.evidence + [v IN $evidence WHERE NOT v IN r.evidence],
                r.confidence = CASE
                    WHEN NOT $has_confidence THEN r.confidence
                    WHEN r.confidence IS NULL OR $confidence > r.confidence THEN $confidence
                    ELSE r.confidence
                END
            RETURN count(r) AS count
            "#
            .to_string(),
        )
        .param("subject", subject.id())
        .param("object", object.id())
        .param("predicate", predicate.to_string())
        .param(
            "source_chunk_ids",
            attrs.source_chunk_ids.iter().cloned().collect::<Vec<_>>(),
        )
        .param("evidence", attrs.evidence.iter().cloned().collect::<Vec<_>>())
        .param("has_confidence", attrs.confidence.is_some())
        .param("confidence", attrs.confidence.unwrap_or(0.0) as f64);

        let mut result = self.graph.execute(query).await.map_err(write_error)?;
        let merged = match result.next().await.map_err(write_error)? {
            Some(row) => row.get::<i64>("count").unwrap_or_default(),
            None => 0,
        };
        if merged == 0 {
            return Err(GraphRagError::GraphWriteError(format!(
                "edge endpoint missing for {} {} {}",
                subject, predicate, object
            )));
        }

        Ok(format!("{}|{}|{}", subject.id(), predicate, object.id()))
    }

    async fn get_entities(&self, keys: &[EntityKey]) -> Result<Vec<Entity>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let query = Query::new(
            r#"
            MATCH (e:Entity) WHERE e.key IN $keys
            RETURN e.name AS name, e.type AS type, e.display_name AS display_name,
                   e.source_chunk_ids AS source_chunk_ids, e.summaries AS summaries
            "#
            .to_string(),
        )
        .param("keys", keys.iter().map(EntityKey::id).collect::<Vec<_>>());

        Ok(self
            .fetch(query)
            .await?
            .iter()
            .map(|row| Entity {
                key: key_from_row(row, "name", "type"),
                attrs: VertexAttrs {
                    display_name: row.get::<String>("display_name").unwrap_or_default(),
                    source_chunk_ids: string_set(row, "source_chunk_ids"),
                    summaries: string_set(row, "summaries"),
                },
            })
            .collect())
    }

    async fn incident_relations(&self, keys: &[EntityKey]) -> Result<Vec<Relation>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let query = Query::new(
            r#"
            MATCH (s:Entity)-[r:RELATION]->(o:Entity)
            WHERE s.key IN $keys OR o.key IN $keys
            RETURN s.name AS s_name, s.type AS s_type, r.predicate AS predicate,
                   o.name AS o_name, o.type AS o_type,
                   r.source_chunk_ids AS source_chunk_ids, r.evidence AS evidence,
                   coalesce(r.confidence, -1.0) AS confidence
            "#
            .to_string(),
        )
        .param("keys", keys.iter().map(EntityKey::id).collect::<Vec<_>>());

        Ok(self
            .fetch(query)
            .await?
            .iter()
            .map(|row| {
                let confidence = row.get::<f64>("confidence").unwrap_or(-1.0);
                Relation {
                    subject: key_from_row(row, "s_name", "s_type"),
                    predicate: row.get::<String>("predicate").unwrap_or_default(),
                    object: key_from_row(row, "o_name", "o_type"),
                    attrs: EdgeAttrs {
                        source_chunk_ids: string_set(row, "source_chunk_ids"),
                        evidence: string_set(row, "evidence"),
                        confidence: (confidence >= 0.0).then_some(confidence as f32),
                    },
                }
            })
            .collect())
    }

    async fn find_by_names(&self, names: &[String]) -> Result<Vec<EntityKey>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let query = Query::new(
            "MATCH (e:Entity) WHERE e.name IN $names RETURN e.name AS name, e.type AS type"
                .to_string(),
        )
        .param("names", names.to_vec());

        let mut keys: Vec<EntityKey> = self
            .fetch(query)
            .await?
            .iter()
            .map(|row| key_from_row(row, "name", "type"))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn stats(&self) -> Result<GraphStats> {
        Ok(GraphStats {
            entity_count: self.count("MATCH (e:Entity) RETURN count(e) AS count").await?,
            relation_count: self
                .count("MATCH ()-[r:RELATION]->() RETURN count(r) AS count")
                .await?,
        })
    }
}
