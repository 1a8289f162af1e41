use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct Metrics {
    // Counters
    total_requests: AtomicUsize,
    successful_requests: AtomicUsize,
    failed_requests: AtomicUsize,

    ingest_runs: AtomicUsize,
    completed_runs: AtomicUsize,
    partially_failed_runs: AtomicUsize,
    failed_runs: AtomicUsize,
    unit_failures: AtomicUsize,

    queries: AtomicUsize,
    failed_queries: AtomicUsize,
    degraded_queries: AtomicUsize,

    // Timing (in microseconds)
    total_ingest_time_us: AtomicU64,
    total_query_time_us: AtomicU64,

    // Counts
    total_chunks_processed: AtomicUsize,
    total_vectors_indexed: AtomicUsize,
}

/// How an ingestion run ended, as far as metrics are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Completed,
    PartiallyFailed,
    Failed,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_ingest(
        &self,
        duration: Duration,
        result: RunResult,
        chunks: usize,
        vectors: usize,
        failures: usize,
    ) {
        self.ingest_runs.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            RunResult::Completed => &self.completed_runs,
            RunResult::PartiallyFailed => &self.partially_failed_runs,
            RunResult::Failed => &self.failed_runs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_ingest_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.total_chunks_processed.fetch_add(chunks, Ordering::Relaxed);
        self.total_vectors_indexed.fetch_add(vectors, Ordering::Relaxed);
        self.unit_failures.fetch_add(failures, Ordering::Relaxed);
    }

    pub fn record_query(&self, duration: Duration, success: bool, degraded: bool) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_queries.fetch_add(1, Ordering::Relaxed);
        }
        if degraded {
            self.degraded_queries.fetch_add(1, Ordering::Relaxed);
        }
        self.total_query_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            ingest_runs: self.ingest_runs.load(Ordering::Relaxed),
            completed_runs: self.completed_runs.load(Ordering::Relaxed),
            partially_failed_runs: self.partially_failed_runs.load(Ordering::Relaxed),
            failed_runs: self.failed_runs.load(Ordering::Relaxed),
            unit_failures: self.unit_failures.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            degraded_queries: self.degraded_queries.load(Ordering::Relaxed),
            avg_ingest_time_ms: avg_time_ms(&self.total_ingest_time_us, &self.ingest_runs),
            avg_query_time_ms: avg_time_ms(&self.total_query_time_us, &self.queries),
            total_chunks_processed: self.total_chunks_processed.load(Ordering::Relaxed),
            total_vectors_indexed: self.total_vectors_indexed.load(Ordering::Relaxed),
        }
    }
}

fn avg_time_ms(total_us: &AtomicU64, count: &AtomicUsize) -> f64 {
    let total = total_us.load(Ordering::Relaxed) as f64;
    let cnt = count.load(Ordering::Relaxed) as f64;
    if cnt > 0.0 {
        total / cnt / 1000.0 // Convert to ms
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub ingest_runs: usize,
    pub completed_runs: usize,
    pub partially_failed_runs: usize,
    pub failed_runs: usize,
    pub unit_failures: usize,
    pub queries: usize,
    pub failed_queries: usize,
    pub degraded_queries: usize,
    pub avg_ingest_time_ms: f64,
    pub avg_query_time_ms: f64,
    pub total_chunks_processed: usize,
    pub total_vectors_indexed: usize,
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
