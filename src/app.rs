use std::sync::Arc;

use crate::config::AppConfig;
use crate::engine::AnalysisEngine;
use crate::metrics::AppMetrics;
use crate::state::SharedState;

/// Shared application context passed to HTTP handlers and the scheduler.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub engine: Arc<AnalysisEngine>,
    pub metrics: AppMetrics,
    pub state: SharedState,
}

impl AppContext {
    pub fn new(
        config: Arc<AppConfig>,
        engine: AnalysisEngine,
        metrics: AppMetrics,
        state: SharedState,
    ) -> Self {
        Self {
            config,
            engine: Arc::new(engine),
            metrics,
            state,
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.config.cluster
    }
}
