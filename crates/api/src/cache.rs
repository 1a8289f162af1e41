use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use common::{LanguageModel, Result};
use index::Embedder;

/// Content-addressed cache for embeddings and model responses.
pub struct Cache {
    embeddings: DashMap<String, Vec<f32>>,
    llm_responses: DashMap<String, String>,
    max_entries: usize,
}

impl Cache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            embeddings: DashMap::new(),
            llm_responses: DashMap::new(),
            max_entries,
        }
    }

    /// Cache an embedding
    pub fn set_embedding(&self, key: &str, embedding: Vec<f32>) {
        if self.max_entries == 0 {
            return;
        }
        evict_if_full(&self.embeddings, self.max_entries);
        self.embeddings.insert(hash_text(key), embedding);
    }

    pub fn get_embedding(&self, key: &str) -> Option<Vec<f32>> {
        self.embeddings.get(&hash_text(key)).map(|r| r.value().clone())
    }

    /// Cache an LLM response
    pub fn set_llm_response(&self, key: &str, response: String) {
        if self.max_entries == 0 {
            return;
        }
        evict_if_full(&self.llm_responses, self.max_entries);
        self.llm_responses.insert(hash_text(key), response);
    }

    pub fn get_llm_response(&self, key: &str) -> Option<String> {
        self.llm_responses.get(&hash_text(key)).map(|r| r.value().clone())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            embeddings_cached: self.embeddings.len(),
            llm_responses_cached: self.llm_responses.len(),
        }
    }

    pub fn clear(&self) {
        self.embeddings.clear();
        self.llm_responses.clear();
    }
}

/// Simple eviction: drop a quarter of the entries when full.
fn evict_if_full<V>(map: &DashMap<String, V>, max_entries: usize) {
    if map.len() < max_entries {
        return;
    }
    let to_remove: Vec<String> = map
        .iter()
        .take((max_entries / 4).max(1))
        .map(|r| r.key().clone())
        .collect();
    for key in to_remove {
        map.remove(&key);
    }
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub embeddings_cached: usize,
    pub llm_responses_cached: usize,
}

/// Embedder decorator that serves repeated texts from the cache.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Arc<Cache>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, cache: Arc<Cache>) -> Self {
        Self { inner, cache }
    }

    fn key(&self, text: &str) -> String {
        format!("{}\n{}", self.inner.model_name(), text)
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = self.key(text);
        if let Some(embedding) = self.cache.get_embedding(&key) {
            return Ok(embedding);
        }
        let embedding = self.inner.embed(text).await?;
        self.cache.set_embedding(&key, embedding.clone());
        Ok(embedding)
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Language-model decorator caching successful responses by prompt. Only worth using
/// for deterministic calls such as extraction.
pub struct CachedLanguageModel {
    inner: Arc<dyn LanguageModel>,
    cache: Arc<Cache>,
}

impl CachedLanguageModel {
    pub fn new(inner: Arc<dyn LanguageModel>, cache: Arc<Cache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl LanguageModel for CachedLanguageModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let key = format!("{}\n{}", self.inner.model_name(), prompt);
        if let Some(response) = self.cache.get_llm_response(&key) {
            return Ok(response);
        }
        let response = self.inner.generate(prompt).await?;
        self.cache.set_llm_response(&key, response.clone());
        Ok(response)
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}
