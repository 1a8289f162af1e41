use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use common::http::{ServiceKind, request_error, status_error};
use common::{LanguageModel, Result};

/// Ollama client for free-text answers.
#[derive(Clone)]
pub struct QueryLLM {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

impl QueryLLM {
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
impl LanguageModel for QueryLLM {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);

        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error(ServiceKind::Generation, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(ServiceKind::Generation, status, &body));
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .map_err(|e| request_error(ServiceKind::Generation, &e))?;

        Ok(ollama_response.response)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
