pub mod evidence;
pub mod keywords;
pub mod llm;
pub mod retriever;
pub mod synthesizer;

pub use evidence::{Answer, BudgetReport, Coverage, EvidenceItem, EvidenceRef, QueryMode, RetrievalMethod};
pub use llm::QueryLLM;
pub use retriever::{HopDecay, HybridRetriever, RetrievalOutcome, RetrieverConfig};
pub use synthesizer::{AnswerSynthesizer, SynthesisConfig};
