use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::cache::{Cache, CacheStats};
use crate::config::AppConfig;
use crate::metrics::MetricsSnapshot;
use crate::pipeline::{HealthReport, IngestOptions, IngestOutcome, Pipeline, QueryRequest};
use common::{ErrorKind, GraphRagError};
use index::IndexStats;
use ingest::{Document, FileReader};
use query::{Answer, QueryMode};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub config: Arc<AppConfig>,
    pub cache: Option<Arc<Cache>>,
    /// Cancelled on shutdown; every ingestion run gets a child token.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(error: GraphRagError) -> ApiError {
    let status = match &error {
        GraphRagError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        GraphRagError::RetrievalError(m) | GraphRagError::GenerationServiceError(m)
            if m == "timeout" =>
        {
            StatusCode::GATEWAY_TIMEOUT
        }
        GraphRagError::TransientServiceError(_) | GraphRagError::Cancelled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        GraphRagError::RetrievalError(_)
        | GraphRagError::GenerationServiceError(_)
        | GraphRagError::EmbeddingServiceError(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            kind: error.kind(),
            message: error.to_string(),
        }),
    )
}

#[derive(Debug, Deserialize)]
pub struct DocumentInput {
    pub source: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub documents: Vec<DocumentInput>,
    /// File or directory on the server to read documents from.
    pub path: Option<String>,
}

/// Per-request overrides of the configured query defaults.
#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    pub k: Option<usize>,
    pub depth: Option<usize>,
    pub token_budget: Option<usize>,
    pub mode: Option<QueryMode>,
    pub deadline_ms: Option<u64>,
}

impl QueryParams {
    fn request(&self, query: String, config: &AppConfig) -> QueryRequest {
        let mut request = QueryRequest::new(query, &config.query);
        if let Some(k) = self.k {
            request.k = k;
        }
        if let Some(depth) = self.depth {
            request.depth = depth;
        }
        if let Some(token_budget) = self.token_budget {
            request.token_budget = token_budget;
        }
        if let Some(mode) = self.mode {
            request.mode = mode;
        }
        if let Some(ms) = self.deadline_ms {
            request.deadline = Some(Duration::from_millis(ms));
        }
        request
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    pub query: String,
    #[serde(flatten)]
    pub params: QueryParams,
}

#[derive(Debug, Deserialize)]
pub struct QueryBatchBody {
    pub queries: Vec<String>,
    #[serde(flatten)]
    pub params: QueryParams,
}

#[derive(Debug, Serialize)]
pub struct BatchAnswer {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<Answer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct QueryBatchResponse {
    pub answers: Vec<BatchAnswer>,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub pipeline: MetricsSnapshot,
    pub cache: Option<CacheStats>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ingest", post(ingest_documents))
        .route("/query", post(answer_query))
        .route("/query/batch", post(answer_queries))
        .route("/stats", get(get_stats))
        .route("/metrics", get(get_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.pipeline.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn ingest_documents(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestOutcome>, ApiError> {
    let mut documents: Vec<Document> = req
        .documents
        .into_iter()
        .map(|input| {
            let mut document = Document::new(input.source, input.text);
            document.metadata = input.metadata;
            document
        })
        .collect();

    if let Some(path) = req.path {
        documents.extend(read_path(PathBuf::from(path)).await?);
    }
    if documents.is_empty() {
        return Err(api_error(GraphRagError::InvalidConfig(
            "request must contain documents or a path".to_string(),
        )));
    }

    let options = IngestOptions::from(state.config.as_ref());
    let result = state
        .pipeline
        .ingest(documents, &options, &state.shutdown.child_token())
        .await;
    state.pipeline.metrics().record_request(result.is_ok());

    result.map(Json).map_err(api_error)
}

async fn read_path(path: PathBuf) -> Result<Vec<Document>, ApiError> {
    if !path.exists() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                kind: ErrorKind::InvalidConfig,
                message: format!("{} does not exist", path.display()),
            }),
        ));
    }

    let documents = if path.is_dir() {
        FileReader::read_directory(&path).await
    } else {
        FileReader::read_file(&path).await.map(|doc| vec![doc])
    };

    documents.map_err(|e| {
        tracing::warn!(path = %path.display(), error = %e, "Failed to read documents");
        api_error(GraphRagError::InvalidConfig(format!("{:#}", e)))
    })
}

async fn answer_query(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Result<Json<Answer>, ApiError> {
    let request = body.params.request(body.query, &state.config);
    let result = state.pipeline.query(&request).await;
    state.pipeline.metrics().record_request(result.is_ok());

    result.map(Json).map_err(api_error)
}

/// Answers every question in order; per-question failures are reported inline.
async fn answer_queries(
    State(state): State<AppState>,
    Json(body): Json<QueryBatchBody>,
) -> Result<Json<QueryBatchResponse>, ApiError> {
    if body.queries.is_empty() {
        return Err(api_error(GraphRagError::InvalidConfig(
            "request must contain at least one query".to_string(),
        )));
    }

    let requests: Vec<QueryRequest> = body
        .queries
        .into_iter()
        .map(|query| body.params.request(query, &state.config))
        .collect();
    let results = state.pipeline.query_batch(&requests).await;
    state.pipeline.metrics().record_request(true);

    let answers = requests
        .into_iter()
        .zip(results)
        .map(|(request, result)| match result {
            Ok(answer) => BatchAnswer {
                query: request.query,
                answer: Some(answer),
                error: None,
            },
            Err(e) => {
                let (_, Json(error)) = api_error(e);
                BatchAnswer {
                    query: request.query,
                    answer: None,
                    error: Some(error),
                }
            }
        })
        .collect();
    Ok(Json(QueryBatchResponse { answers }))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<IndexStats>, ApiError> {
    state.pipeline.stats().await.map(Json).map_err(api_error)
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        pipeline: state.pipeline.metrics().snapshot(),
        cache: state.cache.as_ref().map(|cache| cache.stats()),
    })
}
