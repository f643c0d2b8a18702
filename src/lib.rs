pub mod analyzer;
pub mod app;
pub mod collector;
pub mod config;
pub mod db;
pub mod engine;
pub mod http;
pub mod llm;
pub mod metrics;
pub mod persistence;
pub mod ranker;
pub mod recommendations;
pub mod scheduler;
pub mod snapshot;
pub mod state;
pub mod store;

pub use engine::{AnalysisEngine, EngineError, PersistenceOutcome, RunReport};
pub use recommendations::{Category, Recommendation, Severity, Source, Status, Trigger};
pub use snapshot::{MetricSnapshot, Scope};
