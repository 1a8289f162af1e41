//! Classification of model-service HTTP failures into transient and permanent errors.

use reqwest::StatusCode;

use crate::error::GraphRagError;

/// Which permanent error a service failure maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Extraction,
    Embedding,
    Generation,
}

impl ServiceKind {
    fn permanent(self, message: String) -> GraphRagError {
        match self {
            // A permanently failing extraction call is reported against the chunk like any
            // other unusable extraction output.
            ServiceKind::Extraction => GraphRagError::ExtractionParseError(message),
            ServiceKind::Embedding => GraphRagError::EmbeddingServiceError(message),
            ServiceKind::Generation => GraphRagError::GenerationServiceError(message),
        }
    }
}

/// Timeouts, rate limiting and server-side failures can succeed on a later attempt.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

pub fn status_error(kind: ServiceKind, status: StatusCode, body: &str) -> GraphRagError {
    let message = format!("request failed with status {}: {}", status, body.trim());
    if is_transient_status(status) {
        GraphRagError::TransientServiceError(message)
    } else {
        kind.permanent(message)
    }
}

pub fn request_error(kind: ServiceKind, err: &reqwest::Error) -> GraphRagError {
    if err.is_timeout() || err.is_connect() {
        GraphRagError::TransientServiceError(err.to_string())
    } else {
        kind.permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_and_server_errors_are_transient() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(status_error(ServiceKind::Embedding, status, "").is_transient());
        }
    }

    #[test]
    fn test_client_errors_are_permanent_for_the_service() {
        let err = status_error(ServiceKind::Embedding, StatusCode::BAD_REQUEST, "bad model");
        assert!(matches!(err, GraphRagError::EmbeddingServiceError(_)));

        let err = status_error(ServiceKind::Generation, StatusCode::PAYMENT_REQUIRED, "quota");
        assert!(matches!(err, GraphRagError::GenerationServiceError(_)));

        let err = status_error(ServiceKind::Extraction, StatusCode::NOT_FOUND, "no model");
        assert!(matches!(err, GraphRagError::ExtractionParseError(_)));
    }
}
