pub mod cache;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod server;

pub use cache::{Cache, CachedEmbedder, CachedLanguageModel};
pub use config::AppConfig;
pub use metrics::Metrics;
pub use pipeline::{
    IngestOptions, IngestOutcome, Pipeline, QueryRequest, RunCounters, RunState, Services, Stage,
    UnitFailure,
};
pub use server::{AppState, router};
