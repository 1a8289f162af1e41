use crate::schema::{ExtractionSchema, SUGGESTED_ENTITY_TYPES};

pub fn build_extraction_prompt(chunk_text: &str, schema: &ExtractionSchema) -> String {
    let type_rule = if schema.entity_types.is_empty() {
        format!(
            "Entity types should be short labels such as: {}",
            SUGGESTED_ENTITY_TYPES.join(", ")
        )
    } else {
        format!(
            "Entity types must be one of: {}",
            schema.entity_types.join(", ")
        )
    };
    let predicate_rule = if schema.predicates.is_empty() {
        "Relation types should be short verb phrases in snake_case: \"works_at\", \"based_in\", \"uses\", \"manages\", etc.".to_string()
    } else {
        format!("Relation types must be one of: {}", schema.predicates.join(", "))
    };

    format!(
        r#"Extract entities and relationships from the following text.

INSTRUCTIONS:
1. Identify key entities mentioned in the text
2. Extract directed relationships between those entities
3. Output ONLY valid JSON, nothing else
4. Use the exact schema below

SCHEMA:
{{
  "entities": [
    {{"id": "E1", "name": "EntityName", "type": "TYPE", "description": "brief description", "confidence": 0.9}}
  ],
  "relations": [
    {{"source": "E1", "target": "E2", "relation": "relationship_type", "evidence": "quote from text", "confidence": 0.8}}
  ]
}}

RULES:
- Use sequential IDs: E1, E2, E3, etc.
- {}
- {}
- "source" and "target" must be IDs of entities listed in "entities"
- Evidence must be a direct quote from the text
- Confidence is a number between 0 and 1
- Output ONLY the JSON object, no markdown, no explanations

TEXT:
{}

JSON OUTPUT:"#,
        type_rule, predicate_rule, chunk_text
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_lists_schema_constraints() {
        let schema = ExtractionSchema::new(["PERSON", "ORGANIZATION"], ["works_at"]);
        let prompt = build_extraction_prompt("Alice works at Acme.", &schema);

        assert!(prompt.contains("must be one of: PERSON, ORGANIZATION"));
        assert!(prompt.contains("must be one of: works_at"));
        assert!(prompt.contains("Alice works at Acme."));
    }

    #[test]
    fn test_open_prompt_suggests_types() {
        let prompt = build_extraction_prompt("text", &ExtractionSchema::open());
        assert!(prompt.contains("such as: PERSON"));
    }
}
