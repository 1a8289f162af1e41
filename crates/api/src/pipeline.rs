use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{AppConfig, QueryConfig};
use crate::metrics::{Metrics, RunResult, TimedOperation};
use common::{ErrorKind, GraphRagError, LanguageModel, Result, RetryPolicy};
use extract::{EntityKey, ExtractedChunk, ExtractionSchema, Extractor};
use index::{Embedder, Entity, GraphStore, IndexStats, Indexer, UpsertReport, VectorIndexer, VectorStore};
use ingest::{Chunk, Chunker, ChunkerConfig, Document};
use query::{Answer, AnswerSynthesizer, HybridRetriever, QueryMode, RetrieverConfig, SynthesisConfig};

/// Run-level knobs for one ingestion call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IngestOptions {
    pub chunking: ChunkerConfig,
    pub concurrency_limit: usize,
    pub failure_rate_threshold: f64,
    pub upsert_batch_size: usize,
}

impl IngestOptions {
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        if self.concurrency_limit == 0 {
            return Err(GraphRagError::InvalidConfig(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        if self.upsert_batch_size == 0 {
            return Err(GraphRagError::InvalidConfig(
                "upsert_batch_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(GraphRagError::InvalidConfig(format!(
                "failure_rate_threshold {} must be within [0, 1]",
                self.failure_rate_threshold
            )));
        }
        Ok(())
    }
}

impl From<&AppConfig> for IngestOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            chunking: config.chunking,
            concurrency_limit: config.concurrency.max_concurrent_extractions,
            failure_rate_threshold: config.ingest.failure_rate_threshold,
            upsert_batch_size: config.ingest.upsert_batch_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Chunking,
    Extracting,
    Upserting,
    Indexing,
    Completed,
    PartiallyFailed,
    Failed,
}

/// Stage a unit of work failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extracting,
    Upserting,
    Indexing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    /// Chunk id, or `type:name` for an entity.
    pub unit: String,
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub documents: usize,
    pub chunks: usize,
    pub extracted_chunks: usize,
    pub entities: usize,
    pub relations: usize,
    pub vectors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub run_id: Uuid,
    pub state: RunState,
    pub transitions: Vec<RunState>,
    pub failures: Vec<UnitFailure>,
    pub counters: RunCounters,
    /// Chunks plus entities queued for indexing.
    pub units: usize,
    pub failure_rate: f64,
}

impl IngestOutcome {
    pub fn failed_units(&self) -> BTreeSet<&str> {
        self.failures.iter().map(|f| f.unit.as_str()).collect()
    }
}

/// Per-run bookkeeping. Owned by the `ingest` call; never shared between tasks.
struct Run {
    run_id: Uuid,
    transitions: Vec<RunState>,
    failures: Vec<UnitFailure>,
    failed_units: BTreeSet<String>,
    units: usize,
    counters: RunCounters,
    threshold: f64,
}

impl Run {
    fn new(threshold: f64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            transitions: vec![RunState::Pending],
            failures: Vec::new(),
            failed_units: BTreeSet::new(),
            units: 0,
            counters: RunCounters::default(),
            threshold,
        }
    }

    fn enter(&mut self, state: RunState) {
        tracing::info!(run_id = %self.run_id, stage = ?state, "Entering stage");
        self.transitions.push(state);
    }

    fn fail_unit(&mut self, unit: String, stage: Stage, error: &GraphRagError) {
        tracing::warn!(
            run_id = %self.run_id,
            unit = %unit,
            stage = ?stage,
            error = %error,
            "Unit of work failed"
        );
        self.failed_units.insert(unit.clone());
        self.failures.push(UnitFailure {
            unit,
            stage,
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn failure_rate(&self) -> f64 {
        if self.units == 0 {
            0.0
        } else {
            self.failed_units.len() as f64 / self.units as f64
        }
    }

    fn exceeded(&self) -> bool {
        self.failure_rate() > self.threshold
    }

    fn finish(mut self) -> IngestOutcome {
        let terminal = if self.failed_units.is_empty() {
            RunState::Completed
        } else if self.exceeded() {
            RunState::Failed
        } else {
            RunState::PartiallyFailed
        };
        self.enter(terminal);

        IngestOutcome {
            run_id: self.run_id,
            state: terminal,
            failure_rate: self.failure_rate(),
            transitions: self.transitions,
            failures: self.failures,
            counters: self.counters,
            units: self.units,
        }
    }
}

enum IndexJob<'a> {
    Chunk(&'a Chunk, Vec<EntityKey>),
    Entity(&'a Entity),
}

impl IndexJob<'_> {
    fn unit(&self) -> String {
        match self {
            IndexJob::Chunk(chunk, _) => chunk.chunk_id.clone(),
            IndexJob::Entity(entity) => entity.key.id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub query: String,
    pub k: usize,
    pub depth: usize,
    pub token_budget: usize,
    pub deadline: Option<Duration>,
    pub mode: QueryMode,
}

impl QueryRequest {
    /// A request using the configured defaults.
    pub fn new(query: impl Into<String>, config: &QueryConfig) -> Self {
        Self {
            query: query.into(),
            k: config.top_k,
            depth: config.depth,
            token_budget: config.token_budget,
            deadline: Some(Duration::from_secs(config.deadline_secs)),
            mode: config.mode,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(GraphRagError::InvalidConfig(
                "query text must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// External collaborators the pipeline is wired to.
#[derive(Clone)]
pub struct Services {
    pub extraction_model: Arc<dyn LanguageModel>,
    pub generation_model: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
    pub graph: Arc<dyn GraphStore>,
    pub vectors: Arc<dyn VectorStore>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub graph: String,
    pub vectors: String,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.graph == "ok" && self.vectors == "ok"
    }
}

pub struct Pipeline {
    extractor: Extractor,
    indexer: Indexer,
    retriever: HybridRetriever,
    synthesizer: AnswerSynthesizer,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(
        services: Services,
        schema: ExtractionSchema,
        retriever_config: RetrieverConfig,
        synthesis: SynthesisConfig,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let retriever = HybridRetriever::new(
            services.embedder.clone(),
            services.vectors.clone(),
            services.graph.clone(),
            retriever_config,
        )?;

        Ok(Self {
            extractor: Extractor::new(services.extraction_model, schema),
            indexer: Indexer::new(
                services.graph,
                VectorIndexer::new(services.embedder, services.vectors),
            ),
            retriever,
            synthesizer: AnswerSynthesizer::with_config(services.generation_model, synthesis)?,
            retry,
            metrics: Metrics::new(),
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn init(&self) -> Result<()> {
        self.indexer.init().await
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        self.indexer.stats().await
    }

    pub async fn health(&self) -> HealthReport {
        let (graph, vectors) = tokio::join!(
            self.indexer.graph().stats(),
            self.indexer.vectors.store().count()
        );
        HealthReport {
            graph: graph.map_or_else(|e| format!("error: {}", e), |_| "ok".to_string()),
            vectors: vectors.map_or_else(|e| format!("error: {}", e), |_| "ok".to_string()),
        }
    }

    /// Chunk, extract, upsert and index a batch of documents.
    ///
    /// Only invalid options fail the call. Unit failures are recorded in the outcome and the
    /// run ends `Failed` once their share of units exceeds the threshold.
    pub async fn ingest(
        &self,
        documents: Vec<Document>,
        options: &IngestOptions,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome> {
        options.validate()?;
        let chunker = Chunker::new(options.chunking)?;

        let timer = TimedOperation::start();
        let mut run = Run::new(options.failure_rate_threshold);
        tracing::info!(run_id = %run.run_id, documents = documents.len(), "Starting ingestion run");

        run.enter(RunState::Chunking);
        let chunks = ingest::chunk_documents(&documents, &chunker);
        run.counters.documents = documents.len();
        run.counters.chunks = chunks.len();
        run.units = chunks.len();

        self.process(&mut run, &chunks, options, cancel).await;
        let outcome = run.finish();

        let result = match outcome.state {
            RunState::Completed => RunResult::Completed,
            RunState::PartiallyFailed => RunResult::PartiallyFailed,
            _ => RunResult::Failed,
        };
        self.metrics.record_ingest(
            timer.elapsed(),
            result,
            outcome.counters.chunks,
            outcome.counters.vectors,
            outcome.failures.len(),
        );

        tracing::info!(
            run_id = %outcome.run_id,
            state = ?outcome.state,
            chunks = outcome.counters.chunks,
            entities = outcome.counters.entities,
            relations = outcome.counters.relations,
            vectors = outcome.counters.vectors,
            failures = outcome.failures.len(),
            failure_rate = outcome.failure_rate,
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "Ingestion run finished"
        );
        Ok(outcome)
    }

    /// Stages after chunking. Stops early once the failure rate exceeds the threshold.
    async fn process(
        &self,
        run: &mut Run,
        chunks: &[Chunk],
        options: &IngestOptions,
        cancel: &CancellationToken,
    ) {
        if chunks.is_empty() {
            return;
        }

        run.enter(RunState::Extracting);
        let extracted = self.extract_all(run, chunks, options, cancel).await;
        if run.exceeded() {
            return;
        }

        run.enter(RunState::Upserting);
        let (report, upserted) = self.upsert_all(run, &extracted, options, cancel).await;
        if run.exceeded() {
            return;
        }

        run.enter(RunState::Indexing);
        self.index_all(run, chunks, &extracted, &report, &upserted, options, cancel)
            .await;
    }

    async fn extract_all(
        &self,
        run: &mut Run,
        chunks: &[Chunk],
        options: &IngestOptions,
        cancel: &CancellationToken,
    ) -> Vec<ExtractedChunk> {
        let tasks: Vec<BoxFuture<'_, (usize, Result<ExtractedChunk>)>> = chunks
            .iter()
            .enumerate()
            .map(|(position, chunk)| {
                async move {
                    let result = if cancel.is_cancelled() {
                        Err(GraphRagError::Cancelled)
                    } else {
                        self.retry
                            .retry("extract_chunk", || self.extractor.extract_chunk(chunk))
                            .await
                    };
                    (position, result)
                }
                .boxed()
            })
            .collect();
        let mut results: Vec<(usize, Result<ExtractedChunk>)> = stream::iter(tasks)
            .buffer_unordered(options.concurrency_limit)
            .collect()
            .await;
        results.sort_by_key(|(position, _)| *position);

        let mut extracted = Vec::with_capacity(results.len());
        for (position, result) in results {
            match result {
                Ok(chunk) => extracted.push(chunk),
                Err(e) => run.fail_unit(chunks[position].chunk_id.clone(), Stage::Extracting, &e),
            }
        }
        run.counters.extracted_chunks = extracted.len();
        extracted
    }

    /// Upsert batches concurrently. A rejected batch fails every chunk in it.
    async fn upsert_all(
        &self,
        run: &mut Run,
        extracted: &[ExtractedChunk],
        options: &IngestOptions,
        cancel: &CancellationToken,
    ) -> (UpsertReport, BTreeSet<String>) {
        let upserter = &self.indexer.upserter;
        let tasks: Vec<BoxFuture<'_, (usize, Result<UpsertReport>)>> = extracted
            .chunks(options.upsert_batch_size)
            .enumerate()
            .map(|(position, batch)| {
                async move {
                    let result = if cancel.is_cancelled() {
                        Err(GraphRagError::Cancelled)
                    } else {
                        self.retry
                            .retry("upsert_batch", || upserter.upsert_batch(batch))
                            .await
                    };
                    (position, result)
                }
                .boxed()
            })
            .collect();
        let mut results: Vec<(usize, Result<UpsertReport>)> = stream::iter(tasks)
            .buffer_unordered(options.concurrency_limit)
            .collect()
            .await;
        results.sort_by_key(|(position, _)| *position);

        let mut report = UpsertReport::default();
        let mut upserted = BTreeSet::new();
        for (position, result) in results {
            let start = position * options.upsert_batch_size;
            let end = (start + options.upsert_batch_size).min(extracted.len());
            let batch = &extracted[start..end];
            match result {
                Ok(batch_report) => {
                    report.extend(batch_report);
                    upserted.extend(batch.iter().map(|c| c.chunk_id.clone()));
                }
                Err(e) => {
                    for chunk in batch {
                        run.fail_unit(chunk.chunk_id.clone(), Stage::Upserting, &e);
                    }
                }
            }
        }
        run.counters.entities = report.entity_keys.len();
        run.counters.relations = report.relation_ids.len();
        (report, upserted)
    }

    #[allow(clippy::too_many_arguments)]
    async fn index_all(
        &self,
        run: &mut Run,
        chunks: &[Chunk],
        extracted: &[ExtractedChunk],
        report: &UpsertReport,
        upserted: &BTreeSet<String>,
        options: &IngestOptions,
        cancel: &CancellationToken,
    ) {
        let keys: Vec<EntityKey> = report.entity_keys.iter().cloned().collect();
        run.units += keys.len();

        let mut entities = Vec::new();
        if !keys.is_empty() && cancel.is_cancelled() {
            for key in &keys {
                run.fail_unit(key.id(), Stage::Indexing, &GraphRagError::Cancelled);
            }
        } else if !keys.is_empty() {
            let graph = self.indexer.graph();
            match self
                .retry
                .retry("get_entities", || graph.get_entities(&keys))
                .await
            {
                Ok(found) => entities = found,
                Err(e) => {
                    for key in &keys {
                        run.fail_unit(key.id(), Stage::Indexing, &e);
                    }
                }
            }

            let found: BTreeSet<&EntityKey> = entities.iter().map(|e| &e.key).collect();
            let missing: Vec<&EntityKey> = keys.iter().filter(|k| !found.contains(k)).collect();
            if !entities.is_empty() {
                for key in missing {
                    let e = GraphRagError::GraphWriteError(format!("entity {} missing after upsert", key));
                    run.fail_unit(key.id(), Stage::Indexing, &e);
                }
            }
        }

        // Every chunk's text is indexed. Only upserted chunks reference graph entities.
        let mentions: BTreeMap<&str, Vec<EntityKey>> = extracted
            .iter()
            .filter(|e| upserted.contains(&e.chunk_id))
            .map(|e| (e.chunk_id.as_str(), mentioned_keys(e)))
            .collect();
        let mut jobs: Vec<IndexJob<'_>> = chunks
            .iter()
            .map(|chunk| {
                let keys = mentions.get(chunk.chunk_id.as_str()).cloned().unwrap_or_default();
                IndexJob::Chunk(chunk, keys)
            })
            .collect();
        jobs.extend(entities.iter().map(IndexJob::Entity));

        let vectors = &self.indexer.vectors;
        let tasks: Vec<BoxFuture<'_, (usize, Result<String>)>> = jobs
            .iter()
            .enumerate()
            .map(|(position, job)| {
                async move {
                    let result = if cancel.is_cancelled() {
                        Err(GraphRagError::Cancelled)
                    } else {
                        match job {
                            IndexJob::Chunk(chunk, keys) => {
                                self.retry
                                    .retry("index_chunk", || vectors.index_chunk(chunk, keys))
                                    .await
                            }
                            IndexJob::Entity(entity) => {
                                self.retry
                                    .retry("index_entity", || vectors.index_entity(entity))
                                    .await
                            }
                        }
                    };
                    (position, result)
                }
                .boxed()
            })
            .collect();
        let mut results: Vec<(usize, Result<String>)> = stream::iter(tasks)
            .buffer_unordered(options.concurrency_limit)
            .collect()
            .await;
        results.sort_by_key(|(position, _)| *position);

        for (position, result) in results {
            match result {
                Ok(_) => run.counters.vectors += 1,
                Err(e) => run.fail_unit(jobs[position].unit(), Stage::Indexing, &e),
            }
        }
    }

    /// Retrieve then synthesize, within the request deadline if one is set.
    pub async fn query(&self, request: &QueryRequest) -> Result<Answer> {
        let timer = TimedOperation::start();
        let result = self.answer(request).await;

        let degraded = matches!(&result, Ok(answer) if answer.coverage.is_degraded());
        self.metrics
            .record_query(timer.elapsed(), result.is_ok(), degraded);

        match &result {
            Ok(answer) => tracing::info!(
                mode = ?request.mode,
                citations = answer.citations.len(),
                degraded,
                elapsed_ms = timer.elapsed().as_millis() as u64,
                "Query answered"
            ),
            Err(e) => tracing::warn!(
                mode = ?request.mode,
                error = %e,
                elapsed_ms = timer.elapsed().as_millis() as u64,
                "Query failed"
            ),
        }
        result
    }

    /// Answers each request in turn. A failing request doesn't stop the rest.
    pub async fn query_batch(&self, requests: &[QueryRequest]) -> Vec<Result<Answer>> {
        let mut answers = Vec::with_capacity(requests.len());
        for request in requests {
            answers.push(self.query(request).await);
        }
        tracing::info!(
            questions = requests.len(),
            failed = answers.iter().filter(|a| a.is_err()).count(),
            "Batch answered"
        );
        answers
    }

    async fn answer(&self, request: &QueryRequest) -> Result<Answer> {
        request.validate()?;
        let started = Instant::now();

        let retrieval = self
            .retriever
            .retrieve(&request.query, request.k, request.depth, request.mode);
        let outcome = match request.deadline {
            Some(deadline) => tokio::time::timeout(deadline, retrieval)
                .await
                .map_err(|_| GraphRagError::RetrievalError("timeout".to_string()))??,
            None => retrieval.await?,
        };

        let synthesis = self.synthesizer.synthesize(
            &request.query,
            &outcome.items,
            request.token_budget,
            outcome.coverage,
            request.mode,
        );
        match request.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_sub(started.elapsed());
                tokio::time::timeout(remaining, synthesis)
                    .await
                    .map_err(|_| GraphRagError::GenerationServiceError("timeout".to_string()))?
            }
            None => synthesis.await,
        }
    }
}

/// Entity keys a chunk's extraction mentions, relation endpoints included.
fn mentioned_keys(extracted: &ExtractedChunk) -> Vec<EntityKey> {
    let extraction = &extracted.extraction;
    let keys: BTreeSet<&EntityKey> = extraction
        .entities
        .iter()
        .map(|e| &e.key)
        .chain(
            extraction
                .relations
                .iter()
                .flat_map(|r| [&r.subject, &r.object]),
        )
        .collect();
    keys.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> IngestOptions {
        IngestOptions {
            chunking: ChunkerConfig::default(),
            concurrency_limit: 4,
            failure_rate_threshold: 0.2,
            upsert_batch_size: 8,
        }
    }

    #[test]
    fn test_options_are_validated() {
        assert!(options().validate().is_ok());

        let zero_workers = IngestOptions {
            concurrency_limit: 0,
            ..options()
        };
        assert!(matches!(
            zero_workers.validate(),
            Err(GraphRagError::InvalidConfig(_))
        ));

        let bad_threshold = IngestOptions {
            failure_rate_threshold: 1.5,
            ..options()
        };
        assert!(bad_threshold.validate().is_err());
    }

    #[test]
    fn test_run_terminal_state_follows_threshold() {
        let mut run = Run::new(0.25);
        run.units = 4;
        let err = GraphRagError::ExtractionParseError("no json".into());
        run.fail_unit("c1".into(), Stage::Extracting, &err);
        // The same unit failing again in a later stage still counts once.
        run.fail_unit("c1".into(), Stage::Indexing, &err);
        assert!((run.failure_rate() - 0.25).abs() < f64::EPSILON);

        let outcome = run.finish();
        assert_eq!(outcome.state, RunState::PartiallyFailed);
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.failed_units().len(), 1);

        let mut run = Run::new(0.25);
        run.units = 4;
        run.fail_unit("c1".into(), Stage::Extracting, &err);
        run.fail_unit("c2".into(), Stage::Extracting, &err);
        assert_eq!(run.finish().state, RunState::Failed);
    }

    #[test]
    fn test_blank_query_is_rejected() {
        let request = QueryRequest::new("   ", &QueryConfig::default());
        assert!(matches!(
            request.validate(),
            Err(GraphRagError::InvalidConfig(_))
        ));
    }
}
