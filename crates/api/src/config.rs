use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use common::{GraphRagError, Result, RetryConfig};
use extract::ExtractionSchema;
use ingest::ChunkerConfig;
use query::{QueryMode, RetrieverConfig, SynthesisConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: OperationMode,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub chunking: ChunkerConfig,
    pub ingest: IngestConfig,
    pub schema: ExtractionSchema,
    pub query: QueryConfig,
    pub retriever: RetrieverConfig,
    pub synthesis: SynthesisConfig,
    pub services: ServicesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Fast,      // Use cached results aggressively, more parallel calls
    Accurate,  // Always fresh, fewer parallel calls, more retries
    Balanced,  // Default: cache when available
}

impl FromStr for OperationMode {
    type Err = GraphRagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(OperationMode::Fast),
            "accurate" => Ok(OperationMode::Accurate),
            "balanced" => Ok(OperationMode::Balanced),
            other => Err(GraphRagError::InvalidConfig(format!(
                "unknown operation mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Bound on chunk-parallel extraction, upsert and indexing work.
    pub max_concurrent_extractions: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Fraction of failed units above which a run is marked failed.
    pub failure_rate_threshold: f64,
    pub upsert_batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.2,
            upsert_batch_size: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub top_k: usize,
    pub depth: usize,
    pub token_budget: usize,
    pub deadline_secs: u64,
    pub mode: QueryMode,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            depth: 2,
            token_budget: 3000,
            deadline_secs: 60,
            mode: QueryMode::Hybrid,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Neo4j for the graph, Qdrant for vectors.
    External,
    /// In-process stores; nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    Ollama,
    #[serde(rename = "openai")]
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub bind_addr: String,
    pub storage: StorageBackend,
    pub ollama_url: String,
    pub extraction_model: String,
    pub generation_model: String,
    pub embedding_provider: EmbeddingProvider,
    /// Base URL for the OpenAI-compatible provider, e.g. `https://api.openai.com/v1`.
    pub embedding_url: String,
    pub embedding_model: String,
    pub embedding_api_key: Option<String>,
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub qdrant_url: String,
    pub collection: String,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            storage: StorageBackend::External,
            ollama_url: "http://localhost:11434".to_string(),
            extraction_model: "llama3".to_string(),
            generation_model: "llama3".to_string(),
            embedding_provider: EmbeddingProvider::Ollama,
            embedding_url: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            embedding_api_key: None,
            neo4j_uri: "bolt://localhost:7687".to_string(),
            neo4j_user: "neo4j".to_string(),
            neo4j_password: "password".to_string(),
            qdrant_url: "http://localhost:6333".to_string(),
            collection: "graphrag".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "info".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::with_mode(OperationMode::Balanced)
    }
}

impl AppConfig {
    /// Preset for an operation mode; everything outside concurrency, retry and cache
    /// keeps its default.
    pub fn with_mode(mode: OperationMode) -> Self {
        let (concurrency, retry, cache) = match mode {
            OperationMode::Balanced => (
                ConcurrencyConfig {
                    max_concurrent_extractions: 5,
                    request_timeout_secs: 60,
                },
                RetryConfig {
                    max_retries: 3,
                    initial_backoff_ms: 1000,
                    max_backoff_ms: 10000,
                },
                CacheConfig {
                    enabled: true,
                    max_entries: 10000,
                },
            ),
            OperationMode::Fast => (
                ConcurrencyConfig {
                    max_concurrent_extractions: 20,
                    request_timeout_secs: 30,
                },
                RetryConfig {
                    max_retries: 2,
                    initial_backoff_ms: 500,
                    max_backoff_ms: 5000,
                },
                CacheConfig {
                    enabled: true,
                    max_entries: 50000,
                },
            ),
            OperationMode::Accurate => (
                ConcurrencyConfig {
                    max_concurrent_extractions: 3,
                    request_timeout_secs: 120,
                },
                RetryConfig {
                    max_retries: 5,
                    initial_backoff_ms: 2000,
                    max_backoff_ms: 20000,
                },
                CacheConfig {
                    enabled: false,
                    max_entries: 0,
                },
            ),
        };

        Self {
            mode,
            concurrency,
            retry,
            cache,
            chunking: ChunkerConfig::default(),
            ingest: IngestConfig::default(),
            schema: ExtractionSchema::open(),
            query: QueryConfig::default(),
            retriever: RetrieverConfig::default(),
            synthesis: SynthesisConfig::default(),
            services: ServicesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn fast_mode() -> Self {
        Self::with_mode(OperationMode::Fast)
    }

    pub fn accurate_mode() -> Self {
        Self::with_mode(OperationMode::Accurate)
    }

    /// Optional TOML file, then `GRAPHRAG_*` environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    GraphRagError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        let config = config.with_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. A `mode` key selects the preset the other keys start from.
    pub fn from_toml(text: &str) -> Result<Self> {
        let table: toml::Table = text
            .parse()
            .map_err(|e| GraphRagError::InvalidConfig(format!("invalid TOML: {}", e)))?;

        let mode = match table.get("mode").and_then(|v| v.as_str()) {
            Some(mode) => mode.parse()?,
            None => OperationMode::Balanced,
        };
        let preset = toml::Table::try_from(Self::with_mode(mode))
            .map_err(|e| GraphRagError::InvalidConfig(e.to_string()))?;

        let merged = merge_tables(preset, table);
        merged
            .try_into()
            .map_err(|e: toml::de::Error| GraphRagError::InvalidConfig(e.to_string()))
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("GRAPHRAG_MODE") {
            let mode: OperationMode = mode.parse()?;
            let preset = Self::with_mode(mode);
            self.mode = mode;
            self.concurrency = preset.concurrency;
            self.retry = preset.retry;
            self.cache = preset.cache;
        }

        let services = &mut self.services;
        for (key, slot) in [
            ("GRAPHRAG_BIND_ADDR", &mut services.bind_addr),
            ("GRAPHRAG_OLLAMA_URL", &mut services.ollama_url),
            ("GRAPHRAG_EXTRACTION_MODEL", &mut services.extraction_model),
            ("GRAPHRAG_GENERATION_MODEL", &mut services.generation_model),
            ("GRAPHRAG_EMBEDDING_URL", &mut services.embedding_url),
            ("GRAPHRAG_EMBEDDING_MODEL", &mut services.embedding_model),
            ("GRAPHRAG_NEO4J_URI", &mut services.neo4j_uri),
            ("GRAPHRAG_NEO4J_USER", &mut services.neo4j_user),
            ("GRAPHRAG_NEO4J_PASSWORD", &mut services.neo4j_password),
            ("GRAPHRAG_QDRANT_URL", &mut services.qdrant_url),
            ("GRAPHRAG_COLLECTION", &mut services.collection),
            ("GRAPHRAG_LOG_FILTER", &mut self.logging.filter),
        ] {
            if let Some(value) = lookup(key) {
                *slot = value;
            }
        }
        if let Some(key) = lookup("GRAPHRAG_EMBEDDING_API_KEY") {
            services.embedding_api_key = Some(key);
        }
        if let Some(value) = lookup("GRAPHRAG_STORAGE") {
            services.storage = parse_enum("GRAPHRAG_STORAGE", &value)?;
        }
        if let Some(value) = lookup("GRAPHRAG_EMBEDDING_PROVIDER") {
            services.embedding_provider = parse_enum("GRAPHRAG_EMBEDDING_PROVIDER", &value)?;
        }
        if let Some(value) = lookup("GRAPHRAG_LOG_FORMAT") {
            self.logging.format = parse_enum("GRAPHRAG_LOG_FORMAT", &value)?;
        }

        override_number(&lookup, "GRAPHRAG_MAX_CONCURRENCY", &mut self.concurrency.max_concurrent_extractions)?;
        override_number(&lookup, "GRAPHRAG_FAILURE_RATE_THRESHOLD", &mut self.ingest.failure_rate_threshold)?;
        override_number(&lookup, "GRAPHRAG_UPSERT_BATCH_SIZE", &mut self.ingest.upsert_batch_size)?;
        override_number(&lookup, "GRAPHRAG_TOP_K", &mut self.query.top_k)?;
        override_number(&lookup, "GRAPHRAG_DEPTH", &mut self.query.depth)?;
        override_number(&lookup, "GRAPHRAG_TOKEN_BUDGET", &mut self.query.token_budget)?;
        override_number(&lookup, "GRAPHRAG_MAX_CHUNK_SIZE", &mut self.chunking.max_chunk_size)?;
        override_number(&lookup, "GRAPHRAG_CHUNK_OVERLAP", &mut self.chunking.overlap)?;

        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        self.retriever.validate()?;
        self.synthesis.validate()?;

        if !(0.0..=1.0).contains(&self.ingest.failure_rate_threshold) {
            return Err(GraphRagError::InvalidConfig(format!(
                "failure_rate_threshold {} must be within [0, 1]",
                self.ingest.failure_rate_threshold
            )));
        }
        if self.ingest.upsert_batch_size == 0 {
            return Err(GraphRagError::InvalidConfig(
                "upsert_batch_size must be at least 1".to_string(),
            ));
        }
        if self.concurrency.max_concurrent_extractions == 0 {
            return Err(GraphRagError::InvalidConfig(
                "max_concurrent_extractions must be at least 1".to_string(),
            ));
        }
        if self.query.top_k == 0 || self.query.token_budget == 0 {
            return Err(GraphRagError::InvalidConfig(
                "top_k and token_budget must be positive".to_string(),
            ));
        }
        if self.services.embedding_provider == EmbeddingProvider::OpenAi
            && self.services.embedding_api_key.is_none()
        {
            tracing::warn!("OpenAI-compatible embeddings configured without an API key");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.concurrency.request_timeout_secs)
    }

    pub fn query_deadline(&self) -> Duration {
        Duration::from_secs(self.query.deadline_secs)
    }
}

/// Recursive merge; keys in `overlay` win.
fn merge_tables(mut base: toml::Table, overlay: toml::Table) -> toml::Table {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                let merged = merge_tables(std::mem::take(existing), incoming);
                *existing = merged;
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
    base
}

fn parse_enum<T: serde::de::DeserializeOwned>(key: &str, value: &str) -> Result<T> {
    T::deserialize(toml::Value::String(value.to_ascii_lowercase()))
        .map_err(|e| GraphRagError::InvalidConfig(format!("{}: {}", key, e)))
}

fn override_number<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = lookup(key) {
        *slot = value
            .trim()
            .parse()
            .map_err(|e| GraphRagError::InvalidConfig(format!("{}: {}", key, e)))?;
    }
    Ok(())
}
