pub mod llm;
pub mod normalizer;
pub mod parser;
pub mod prompt;
pub mod schema;

pub use llm::OllamaClient;
pub use normalizer::{EntityKey, EntityNormalizer};
pub use parser::{ExtractionParser, ParseFailure, ParsedItem};
pub use schema::{EntityStub, ExtractedChunk, ExtractionResult, ExtractionSchema, RelationStub};

use std::sync::Arc;

use common::{LanguageModel, Result};
use ingest::Chunk;

/// Turns one chunk into entity and relation stubs through a single model call.
#[derive(Clone)]
pub struct Extractor {
    llm_client: Arc<dyn LanguageModel>,
    normalizer: EntityNormalizer,
    schema: ExtractionSchema,
}

impl Extractor {
    pub fn new(llm_client: Arc<dyn LanguageModel>, schema: ExtractionSchema) -> Self {
        Self {
            llm_client,
            normalizer: EntityNormalizer::new(),
            schema,
        }
    }

    /// Extract entities and relations from a chunk of text.
    ///
    /// Transient model failures are returned as-is so the caller can retry them;
    /// unusable output fails with `ExtractionParseError`.
    pub async fn extract_from_text(&self, chunk_id: &str, text: &str) -> Result<ExtractionResult> {
        let prompt = prompt::build_extraction_prompt(text, &self.schema);

        let raw = self.llm_client.generate(&prompt).await?;

        let items = ExtractionParser::new(&self.schema, &self.normalizer).parse(&raw, chunk_id);
        let result = parser::into_result(items)?;

        tracing::debug!(
            chunk_id,
            entities = result.entities.len(),
            relations = result.relations.len(),
            "Extracted chunk"
        );
        Ok(result)
    }

    /// Extract from a chunk with metadata
    pub async fn extract_chunk(&self, chunk: &Chunk) -> Result<ExtractedChunk> {
        // Whitespace-only spans carry nothing to extract; skip the model call.
        let extraction = if chunk.is_blank() {
            ExtractionResult::default()
        } else {
            self.extract_from_text(&chunk.chunk_id, &chunk.text).await?
        };

        Ok(ExtractedChunk {
            chunk_id: chunk.chunk_id.clone(),
            doc_id: chunk.doc_id.clone(),
            extraction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::GraphRagError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedModel {
        output: std::result::Result<String, GraphRagError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for FixedModel {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.output.clone()
        }

        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    fn extractor(output: std::result::Result<String, GraphRagError>) -> (Extractor, Arc<FixedModel>) {
        let model = Arc::new(FixedModel {
            output,
            calls: AtomicUsize::new(0),
        });
        (Extractor::new(model.clone(), ExtractionSchema::open()), model)
    }

    fn chunk(text: &str) -> Chunk {
        Chunk::new("doc".into(), 0, text.into(), "test.txt".into(), (0, text.len()))
    }

    #[tokio::test]
    async fn test_extracts_alice_scenario() {
        let output = r#"{"entities": [
                {"id": "E1", "name": "Alice", "type": "Person"},
                {"id": "E2", "name": "Acme", "type": "Org"},
                {"id": "E3", "name": "Springfield", "type": "Location"}],
            "relations": [
                {"source": "E1", "target": "E2", "relation": "works_at"},
                {"source": "E2", "target": "E3", "relation": "based_in"}]}"#;
        let (extractor, _) = extractor(Ok(output.to_string()));
        let chunk = chunk("Alice works at Acme. Acme is based in Springfield.");

        let extracted = extractor.extract_chunk(&chunk).await.unwrap();

        assert_eq!(extracted.chunk_id, chunk.chunk_id);
        assert_eq!(extracted.extraction.entities.len(), 3);
        assert_eq!(extracted.extraction.relations[0].predicate, "works_at");
        assert_eq!(extracted.extraction.relations[1].object.id(), "location:springfield");
        assert!(extracted
            .extraction
            .entities
            .iter()
            .all(|e| e.source_chunk_id == chunk.chunk_id));
    }

    #[tokio::test]
    async fn test_transient_errors_pass_through() {
        let (extractor, _) = extractor(Err(GraphRagError::TransientServiceError("timeout".into())));
        let err = extractor.extract_chunk(&chunk("Alice")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_garbage_output_is_a_parse_error() {
        let (extractor, _) = extractor(Ok("I could not find any entities.".to_string()));
        let err = extractor.extract_chunk(&chunk("Alice")).await.unwrap_err();
        assert!(matches!(err, GraphRagError::ExtractionParseError(_)));
    }

    #[tokio::test]
    async fn test_blank_chunk_skips_model() {
        let (extractor, model) = extractor(Ok("{}".to_string()));
        let extracted = extractor.extract_chunk(&chunk("  \n\n ")).await.unwrap();
        assert!(extracted.extraction.is_empty());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }
}
