use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use common::http::{ServiceKind, request_error, status_error};
use common::{GraphRagError, Result};

/// Text to fixed-length vector. Implementations must return vectors of one dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn model_name(&self) -> &str;

    /// Probe the model once to learn its output dimension.
    async fn dimension(&self) -> Result<usize> {
        Ok(self.embed("test").await?.len())
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn non_empty(embedding: Vec<f32>) -> Result<Vec<f32>> {
    if embedding.is_empty() {
        return Err(GraphRagError::EmbeddingServiceError(
            "model returned an empty embedding".to_string(),
        ));
    }
    Ok(embedding)
}

/// Ollama `/api/embeddings` client.
#[derive(Clone)]
pub struct EmbeddingClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(base_url: String, model: String) -> Self {
        Self::with_timeout(base_url, model, Duration::from_secs(60))
    }

    pub fn with_timeout(base_url: String, model: String, timeout: Duration) -> Self {
        Self {
            base_url,
            model,
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);

        let request = EmbeddingRequest {
            model: self.model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error(ServiceKind::Embedding, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(ServiceKind::Embedding, status, &body));
        }

        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| request_error(ServiceKind::Embedding, &e))?;

        non_empty(embedding_response.embedding)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Client for OpenAI-compatible `/embeddings` endpoints.
#[derive(Clone)]
pub struct OpenAiEmbeddingClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

impl OpenAiEmbeddingClient {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            base_url,
            model,
            api_key,
            client: http_client(Duration::from_secs(60)),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));

        let mut request = self.client.post(&url).json(&OpenAiEmbeddingRequest {
            model: &self.model,
            input: text,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| request_error(ServiceKind::Embedding, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(ServiceKind::Embedding, status, &body));
        }

        let parsed: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| request_error(ServiceKind::Embedding, &e))?;

        let embedding = parsed.data.into_iter().next().map(|d| d.embedding);
        non_empty(embedding.unwrap_or_default())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_ollama_embedding() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/embeddings").matches(|req| {
                serde_json::from_slice::<serde_json::Value>(req.body().as_ref())
                    .map(|body| body["prompt"] == "Alice" && body["model"] == "nomic-embed-text")
                    .unwrap_or(false)
            });
            then.status(200).json_body(json!({"embedding": [0.1, 0.2, 0.3]}));
        });

        let client = EmbeddingClient::new(server.base_url(), "nomic-embed-text".into());
        let embedding = client.embed("Alice").await.unwrap();

        mock.assert_calls(1);
        assert_eq!(embedding, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_dimension_comes_from_one_embedding() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/api/embeddings");
            then.status(200).json_body(json!({"embedding": [0.0, 1.0]}));
        });

        let client = EmbeddingClient::new(server.base_url(), "m".into());
        assert_eq!(client.dimension().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_embedding_is_an_error() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/api/embeddings");
            then.status(200).json_body(json!({"embedding": []}));
        });

        let client = EmbeddingClient::new(server.base_url(), "m".into());
        let err = client.embed("x").await.unwrap_err();
        assert!(matches!(err, GraphRagError::EmbeddingServiceError(_)));
    }

    #[tokio::test]
    async fn test_openai_embedding_sends_bearer_key() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/embeddings")
                .header("authorization", "Bearer sk-test");
            then.status(200)
                .json_body(json!({"data": [{"index": 0, "embedding": [0.5, 0.5]}]}));
        });

        let client = OpenAiEmbeddingClient::new(
            format!("{}/v1", server.base_url()),
            "text-embedding-3-small".into(),
            Some("sk-test".into()),
        );
        let embedding = client.embed("Acme").await.unwrap();

        mock.assert_calls(1);
        assert_eq!(embedding, vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/embeddings");
            then.status(429).body("slow down");
        });

        let client = OpenAiEmbeddingClient::new(server.base_url(), "m".into(), None);
        assert!(client.embed("x").await.unwrap_err().is_transient());
    }
}
