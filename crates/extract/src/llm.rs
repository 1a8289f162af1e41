use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use common::http::{ServiceKind, request_error, status_error};
use common::{LanguageModel, Result};

/// Ollama client that forces JSON output, used for extraction.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: String, // "json" for structured output
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String) -> Self {
        Self::with_timeout(base_url, model, Duration::from_secs(120))
    }

    pub fn with_timeout(base_url: String, model: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            model,
            client,
        }
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);

        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            format: "json".to_string(), // Force JSON output
            // Extraction should be repeatable for the same chunk
            options: OllamaOptions { temperature: 0.0 },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error(ServiceKind::Extraction, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(ServiceKind::Extraction, status, &body));
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .map_err(|e| request_error(ServiceKind::Extraction, &e))?;

        Ok(ollama_response.response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::GraphRagError;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> OllamaClient {
        OllamaClient::new(server.base_url(), "llama3".to_string())
    }

    #[tokio::test]
    async fn test_generate_requests_json_format() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .matches(|req| {
                    let body: serde_json::Value =
                        serde_json::from_slice(req.body().as_ref()).unwrap();
                    body["format"] == "json" && body["stream"] == false
                });
            then.status(200).json_body(json!({ "response": "{\"entities\": []}" }));
        });

        let output = client(&server).generate("prompt").await.unwrap();

        mock.assert_calls(1);
        assert_eq!(output, "{\"entities\": []}");
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(429).body("slow down");
        });

        let err = client(&server).generate("prompt").await.unwrap_err();
        assert!(matches!(err, GraphRagError::TransientServiceError(_)));
    }

    #[tokio::test]
    async fn test_missing_model_is_permanent() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(404).body("model not found");
        });

        let err = client(&server).generate("prompt").await.unwrap_err();
        assert!(!err.is_transient());
    }
}
