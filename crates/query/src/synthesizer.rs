use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::evidence::{Answer, BudgetReport, Coverage, EvidenceItem, EvidenceRef, QueryMode};
use common::{GraphRagError, LanguageModel, Result};
use ingest::estimate_tokens;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Replaces the built-in answer prompt. `{context}` and `{question}` are substituted.
    pub answer_prompt: Option<String>,
    /// Background placed ahead of the retrieved evidence. Not counted against the budget.
    pub related_information: Option<String>,
}

impl SynthesisConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(template) = &self.answer_prompt {
            if !template.contains("{question}") {
                return Err(GraphRagError::InvalidConfig(
                    "answer_prompt must contain a {question} placeholder".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Packs ranked evidence into a prompt under a token budget and asks the model once.
pub struct AnswerSynthesizer {
    llm: Arc<dyn LanguageModel>,
    config: SynthesisConfig,
    marker: Regex,
    placeholder: Regex,
}

impl AnswerSynthesizer {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            llm,
            config: SynthesisConfig::default(),
            marker: Regex::new(r"\[(\d+)\]").expect("static regex"),
            placeholder: Regex::new(r"\{(context|question)\}").expect("static regex"),
        }
    }

    pub fn with_config(llm: Arc<dyn LanguageModel>, config: SynthesisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new(llm)
        })
    }

    /// Greedy packing in rank order. An item that doesn't fit is skipped whole and later,
    /// smaller items may still be included.
    pub fn pack<'a>(items: &'a [EvidenceItem], token_budget: usize) -> (Vec<&'a EvidenceItem>, BudgetReport) {
        let mut report = BudgetReport {
            budget: token_budget,
            ..Default::default()
        };
        let mut included = Vec::new();
        for item in items {
            let cost = estimate_tokens(&item.text);
            if report.used + cost <= token_budget {
                report.used += cost;
                included.push(item);
            } else {
                report.skipped += 1;
            }
        }
        report.included = included.len();
        (included, report)
    }

    pub async fn synthesize(
        &self,
        query: &str,
        items: &[EvidenceItem],
        token_budget: usize,
        coverage: Coverage,
        mode: QueryMode,
    ) -> Result<Answer> {
        let (included, budget) = Self::pack(items, token_budget);

        let prompt = if mode == QueryMode::Raw {
            build_raw_prompt(query)
        } else {
            self.build_prompt(query, &included)
        };

        let text = self.llm.generate(&prompt).await.map_err(|e| match e {
            GraphRagError::GenerationServiceError(_) => e,
            other => GraphRagError::GenerationServiceError(other.to_string()),
        })?;

        let citations = self.citations(&text, &included);

        tracing::debug!(
            included = budget.included,
            skipped = budget.skipped,
            used_tokens = budget.used,
            citations = citations.len(),
            "Synthesized answer"
        );

        Ok(Answer {
            text,
            citations,
            budget,
            coverage,
            mode,
        })
    }

    /// Items referenced by `[n]` markers in the answer, or every included item when the
    /// answer references none.
    fn citations(&self, text: &str, included: &[&EvidenceItem]) -> Vec<EvidenceItem> {
        let referenced: BTreeSet<usize> = self
            .marker
            .captures_iter(text)
            .filter_map(|c| c[1].parse::<usize>().ok())
            .filter(|&n| n >= 1 && n <= included.len())
            .collect();

        if referenced.is_empty() {
            included.iter().map(|&item| item.clone()).collect()
        } else {
            referenced.iter().map(|&n| included[n - 1].clone()).collect()
        }
    }

    fn build_prompt(&self, query: &str, included: &[&EvidenceItem]) -> String {
        let context = build_context(self.config.related_information.as_deref(), included);
        match &self.config.answer_prompt {
            // Single pass, so placeholder text inside the context or question is left alone.
            Some(template) => self
                .placeholder
                .replace_all(template, |caps: &Captures| match &caps[1] {
                    "context" => context.clone(),
                    _ => query.to_string(),
                })
                .into_owned(),
            None => default_prompt(query, &context),
        }
    }
}

fn label(item: &EvidenceItem) -> &'static str {
    match item.reference {
        EvidenceRef::Chunk { .. } => "text",
        EvidenceRef::Entity { .. } => "entity",
        EvidenceRef::Relation { .. } => "relation",
    }
}

fn build_context(related_information: Option<&str>, included: &[&EvidenceItem]) -> String {
    let mut context = String::new();
    if let Some(info) = related_information.map(str::trim).filter(|info| !info.is_empty()) {
        context.push_str(&format!("Related information: {}\n", info));
    }
    for (i, item) in included.iter().enumerate() {
        context.push_str(&format!("[{}] ({}) {}\n", i + 1, label(item), item.text));
    }
    if included.is_empty() {
        context.push_str("(no relevant context was found)\n");
    }
    context
}

fn default_prompt(query: &str, context: &str) -> String {
    format!(
        r#"You are a helpful assistant answering questions based on the provided context.

CONTEXT:
{}
USER QUESTION: {}

INSTRUCTIONS:
- Answer the question using only information from the context above
- Cite the context items you use with their bracketed numbers, e.g. [1]
- If the context doesn't contain enough information, say so
- Keep your answer concise and factual

ANSWER:"#,
        context, query
    )
}

fn build_raw_prompt(query: &str) -> String {
    format!(
        "Answer the following question concisely and factually.\n\nQUESTION: {}\n\nANSWER:",
        query
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::RetrievalMethod;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct RecordingModel {
        reply: std::result::Result<String, GraphRagError>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LanguageModel for RecordingModel {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone()
        }

        fn model_name(&self) -> &str {
            "recording"
        }
    }

    fn model(reply: std::result::Result<&str, GraphRagError>) -> Arc<RecordingModel> {
        Arc::new(RecordingModel {
            reply: reply.map(String::from),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn item(id: &str, text: &str, score: f32) -> EvidenceItem {
        EvidenceItem {
            object_id: format!("chunk:{}", id),
            reference: EvidenceRef::Chunk { chunk_id: id.into() },
            score,
            methods: BTreeSet::from([RetrievalMethod::Vector]),
            text: text.into(),
            hops: None,
        }
    }

    fn items() -> Vec<EvidenceItem> {
        vec![
            item("a", "Alice works at Acme.", 0.9),
            item("b", "Acme is a large company with offices in many cities around the world.", 0.8),
            item("c", "Acme is based in Springfield.", 0.7),
        ]
    }

    #[test]
    fn test_pack_skips_items_that_overflow() {
        let items = items();
        // 4 words -> 6 tokens, 13 words -> 17 tokens, 5 words -> 7 tokens
        let (included, report) = AnswerSynthesizer::pack(&items, 14);

        let ids: Vec<_> = included.iter().map(|i| i.object_id.as_str()).collect();
        assert_eq!(ids, vec!["chunk:a", "chunk:c"]);
        assert_eq!(
            report,
            BudgetReport {
                budget: 14,
                used: 13,
                included: 2,
                skipped: 1
            }
        );
    }

    #[tokio::test]
    async fn test_citations_narrow_to_markers() {
        let llm = model(Ok("Acme is based in Springfield [2]."));
        let synthesizer = AnswerSynthesizer::new(llm.clone());

        let answer = synthesizer
            .synthesize("Where is Acme?", &items(), 14, Coverage::Full, QueryMode::Hybrid)
            .await
            .unwrap();

        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].object_id, "chunk:c");
        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("[2] (text) Acme is based in Springfield."));
        assert!(!prompts[0].contains("offices"));
    }

    #[tokio::test]
    async fn test_without_markers_all_included_items_are_cited() {
        let synthesizer = AnswerSynthesizer::new(model(Ok("Springfield. See [7].")));
        let answer = synthesizer
            .synthesize("Where is Acme?", &items(), 1000, Coverage::Full, QueryMode::Hybrid)
            .await
            .unwrap();
        assert_eq!(answer.citations.len(), 3);
    }

    #[tokio::test]
    async fn test_zero_budget_sends_no_context() {
        let llm = model(Ok("I don't know."));
        let synthesizer = AnswerSynthesizer::new(llm.clone());
        let answer = synthesizer
            .synthesize("Where is Acme?", &items(), 0, Coverage::Full, QueryMode::Hybrid)
            .await
            .unwrap();

        assert!(answer.citations.is_empty());
        assert_eq!(answer.budget.skipped, 3);
        assert!(llm.prompts.lock().unwrap()[0].contains("no relevant context"));
    }

    #[tokio::test]
    async fn test_provider_failure_is_a_generation_error() {
        let synthesizer = AnswerSynthesizer::new(model(Err(GraphRagError::TransientServiceError(
            "503".into(),
        ))));
        let err = synthesizer
            .synthesize("q", &items(), 100, Coverage::Full, QueryMode::Hybrid)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphRagError::GenerationServiceError(_)));
    }

    #[tokio::test]
    async fn test_answer_prompt_template_is_filled() {
        let llm = model(Ok("Springfield [1]."));
        let config = SynthesisConfig {
            answer_prompt: Some("Q: {question}\nFACTS:\n{context}END".to_string()),
            related_information: Some("Acme moved offices in 2020.".to_string()),
        };
        let synthesizer = AnswerSynthesizer::with_config(llm.clone(), config).unwrap();

        synthesizer
            .synthesize("Where is {context} Acme?", &items()[..1], 100, Coverage::Full, QueryMode::Hybrid)
            .await
            .unwrap();

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(
            prompts[0],
            "Q: Where is {context} Acme?\nFACTS:\nRelated information: Acme moved offices in 2020.\n[1] (text) Alice works at Acme.\nEND"
        );
    }

    #[tokio::test]
    async fn test_related_information_precedes_evidence() {
        let llm = model(Ok("ok"));
        let config = SynthesisConfig {
            related_information: Some("Acme is a fictional company.".to_string()),
            ..Default::default()
        };
        let synthesizer = AnswerSynthesizer::with_config(llm.clone(), config).unwrap();

        let answer = synthesizer
            .synthesize("Where is Acme?", &items(), 1000, Coverage::Full, QueryMode::Hybrid)
            .await
            .unwrap();

        let prompt = llm.prompts.lock().unwrap()[0].clone();
        let background = prompt.find("Related information: Acme is a fictional company.").unwrap();
        let first = prompt.find("[1] (text)").unwrap();
        assert!(background < first);
        // Background is neither numbered nor cited
        assert_eq!(answer.citations.len(), 3);
    }

    #[test]
    fn test_template_without_question_is_rejected() {
        let config = SynthesisConfig {
            answer_prompt: Some("Just answer: {context}".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            AnswerSynthesizer::with_config(model(Ok("")), config),
            Err(GraphRagError::InvalidConfig(_))
        ));
    }
}
