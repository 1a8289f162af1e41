use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use api::config::{EmbeddingProvider, LogFormat, LoggingConfig, StorageBackend};
use api::{AppConfig, AppState, Cache, CachedEmbedder, CachedLanguageModel, Pipeline, Services, router};
use common::{LanguageModel, RetryPolicy};
use extract::OllamaClient;
use index::{
    Embedder, EmbeddingClient, GraphStore, MemoryGraphStore, MemoryVectorStore, Neo4jGraphStore,
    OpenAiEmbeddingClient, QdrantVectorStore, VectorStore,
};
use query::QueryLLM;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config file from GRAPHRAG_CONFIG or the first argument
    let config_path = std::env::var("GRAPHRAG_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1))
        .map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    init_tracing(&config.logging);
    info!(
        mode = ?config.mode,
        storage = ?config.services.storage,
        "Starting GraphRAG service"
    );

    let cache = config
        .cache
        .enabled
        .then(|| Arc::new(Cache::new(config.cache.max_entries)));

    let services = build_services(&config, cache.as_ref()).await?;
    let pipeline = Pipeline::new(
        services,
        config.schema.clone(),
        config.retriever.clone(),
        config.synthesis.clone(),
        RetryPolicy::from_config(&config.retry),
    )
    .context("Failed to build pipeline")?;

    pipeline.init().await.context("Failed to initialize stores")?;

    let shutdown = CancellationToken::new();
    let bind_addr = config.services.bind_addr.clone();
    let state = AppState {
        pipeline: Arc::new(pipeline),
        config: Arc::new(config),
        cache,
        shutdown: shutdown.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("Server error")?;

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

async fn build_services(config: &AppConfig, cache: Option<&Arc<Cache>>) -> anyhow::Result<Services> {
    let services = &config.services;
    let timeout = config.request_timeout();

    let (graph, vectors): (Arc<dyn GraphStore>, Arc<dyn VectorStore>) = match services.storage {
        StorageBackend::External => {
            let graph = Neo4jGraphStore::connect(
                &services.neo4j_uri,
                &services.neo4j_user,
                &services.neo4j_password,
            )
            .await
            .context("Failed to connect to Neo4j")?;
            let vectors =
                QdrantVectorStore::new(services.qdrant_url.clone(), services.collection.clone());
            (Arc::new(graph), Arc::new(vectors))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory stores; nothing survives a restart");
            (
                Arc::new(MemoryGraphStore::new()),
                Arc::new(MemoryVectorStore::new()),
            )
        }
    };

    let embedder: Arc<dyn Embedder> = match services.embedding_provider {
        EmbeddingProvider::Ollama => Arc::new(EmbeddingClient::with_timeout(
            services.embedding_url.clone(),
            services.embedding_model.clone(),
            timeout,
        )),
        EmbeddingProvider::OpenAi => Arc::new(OpenAiEmbeddingClient::new(
            services.embedding_url.clone(),
            services.embedding_model.clone(),
            services.embedding_api_key.clone(),
        )),
    };

    let extraction_model: Arc<dyn LanguageModel> = Arc::new(OllamaClient::with_timeout(
        services.ollama_url.clone(),
        services.extraction_model.clone(),
        timeout,
    ));
    let generation_model: Arc<dyn LanguageModel> = Arc::new(QueryLLM::with_timeout(
        services.ollama_url.clone(),
        services.generation_model.clone(),
        timeout,
    ));

    // Answers depend on retrieved context, so only extraction responses are cached.
    let (embedder, extraction_model) = match cache {
        Some(cache) => (
            Arc::new(CachedEmbedder::new(embedder, cache.clone())) as Arc<dyn Embedder>,
            Arc::new(CachedLanguageModel::new(extraction_model, cache.clone()))
                as Arc<dyn LanguageModel>,
        ),
        None => (embedder, extraction_model),
    };

    Ok(Services {
        extraction_model,
        generation_model,
        embedder,
        graph,
        vectors,
    })
}

async fn shutdown_signal(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down, cancelling in-flight ingestion runs");
    token.cancel();
}
