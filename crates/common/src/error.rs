//! Error taxonomy shared by every pipeline stage.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphRagError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transient service error: {0}")]
    TransientServiceError(String),

    #[error("Failed to parse extraction output: {0}")]
    ExtractionParseError(String),

    #[error("Embedding service error: {0}")]
    EmbeddingServiceError(String),

    #[error("Generation service error: {0}")]
    GenerationServiceError(String),

    #[error("Graph write rejected: {0}")]
    GraphWriteError(String),

    #[error("Vector store error: {0}")]
    VectorStoreError(String),

    #[error("Retrieval failed: {0}")]
    RetrievalError(String),

    #[error("Cancelled before the unit of work started")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, GraphRagError>;

/// Serializable discriminant used in run reports and HTTP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidConfig,
    TransientServiceError,
    ExtractionParseError,
    EmbeddingServiceError,
    GenerationServiceError,
    GraphWriteError,
    VectorStoreError,
    RetrievalError,
    Cancelled,
}

impl GraphRagError {
    /// Only transient failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, GraphRagError::TransientServiceError(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphRagError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            GraphRagError::TransientServiceError(_) => ErrorKind::TransientServiceError,
            GraphRagError::ExtractionParseError(_) => ErrorKind::ExtractionParseError,
            GraphRagError::EmbeddingServiceError(_) => ErrorKind::EmbeddingServiceError,
            GraphRagError::GenerationServiceError(_) => ErrorKind::GenerationServiceError,
            GraphRagError::GraphWriteError(_) => ErrorKind::GraphWriteError,
            GraphRagError::VectorStoreError(_) => ErrorKind::VectorStoreError,
            GraphRagError::RetrievalError(_) => ErrorKind::RetrievalError,
            GraphRagError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<serde_json::Error> for GraphRagError {
    fn from(err: serde_json::Error) -> Self {
        GraphRagError::ExtractionParseError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(GraphRagError::TransientServiceError("rate limited".into()).is_transient());
        assert!(!GraphRagError::ExtractionParseError("bad json".into()).is_transient());
        assert!(!GraphRagError::GraphWriteError("constraint".into()).is_transient());
        assert!(!GraphRagError::Cancelled.is_transient());
    }

    #[test]
    fn test_error_display_includes_message() {
        let err = GraphRagError::InvalidConfig("overlap >= max_chunk_size".into());
        assert!(err.to_string().contains("Invalid configuration"));
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let kind = GraphRagError::GraphWriteError("down".into()).kind();
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"graph_write_error\"");
    }
}
