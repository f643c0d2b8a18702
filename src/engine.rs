//! One analysis run per scope: collect, analyze, enrich, rank, persist.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::analyzer;
use crate::collector::{CollectionError, SnapshotSource, collect_with_retry};
use crate::config::AppConfig;
use crate::llm::{AnalysisContext, LlmAdapter};
use crate::metrics::AppMetrics;
use crate::ranker;
use crate::recommendations::{AnalysisRun, EnrichmentStatus, Recommendation, Status, Trigger};
use crate::snapshot::{MetricSnapshot, Scope};
use crate::store::{RecommendationFilter, ResultStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("an analysis run for scope {0} is already in progress")]
    Busy(String),
    #[error("collection failed: {0}")]
    Collection(#[from] CollectionError),
    #[error("heuristic analysis aborted: {0}")]
    Analysis(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Whether the run's results reached the store.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PersistenceOutcome {
    Saved,
    /// The analysis ran but its results were not saved.
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: AnalysisRun,
    pub recommendations: Vec<Recommendation>,
    pub persistence: PersistenceOutcome,
}

/// Orchestrates analysis runs over an explicit snapshot source, an optional
/// LLM adapter and the result store.
pub struct AnalysisEngine {
    source: Arc<dyn SnapshotSource>,
    adapter: Option<LlmAdapter>,
    store: ResultStore,
    config: Arc<AppConfig>,
    metrics: AppMetrics,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Holds a scope's run slot; released on drop.
struct ScopeGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl AnalysisEngine {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        store: ResultStore,
        config: Arc<AppConfig>,
        metrics: AppMetrics,
    ) -> Self {
        Self {
            source,
            adapter: None,
            store,
            config,
            metrics,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_adapter(mut self, adapter: Option<LlmAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    fn claim(&self, scope: &Scope) -> Result<ScopeGuard, EngineError> {
        let key = scope.key();
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(key.clone()) {
            return Err(EngineError::Busy(key));
        }
        Ok(ScopeGuard {
            in_flight: Arc::clone(&self.in_flight),
            key,
        })
    }

    /// Run the full pipeline for one scope.
    ///
    /// A second request for a scope that is already running is rejected with
    /// [`EngineError::Busy`]. LLM problems never fail the run; store problems
    /// are reported through [`RunReport::persistence`].
    #[instrument(skip_all, fields(scope = %scope, trigger = trigger.as_str()))]
    pub async fn run_analysis(
        &self,
        scope: Scope,
        trigger: Trigger,
    ) -> Result<RunReport, EngineError> {
        let started = Instant::now();
        let _guard = match self.claim(&scope) {
            Ok(guard) => guard,
            Err(err) => {
                self.metrics.record_run(trigger, "busy", started.elapsed());
                return Err(err);
            }
        };
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let snapshot = match self.collect(&scope).await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(err) => {
                error!(%run_id, error = %err, "collection failed; run aborted");
                self.metrics.inc_collection_failure(err.kind());
                self.metrics.record_run(trigger, "failed", started.elapsed());
                return Err(err.into());
            }
        };
        self.metrics
            .set_missing_sections(snapshot.missing_sections.len());

        let heuristic = {
            let snapshot = Arc::clone(&snapshot);
            let config = self.config.analyzer.clone();
            tokio::task::spawn_blocking(move || analyzer::analyze(&snapshot, &config))
        };
        let (heuristic, (llm, enrichment)) = tokio::join!(heuristic, self.enrich(&snapshot));
        let heuristic = match heuristic {
            Ok(candidates) => candidates,
            Err(err) => {
                self.metrics.record_run(trigger, "failed", started.elapsed());
                return Err(err.into());
            }
        };
        self.metrics.record_enrichment(&enrichment);

        let mut recommendations = ranker::rank(heuristic, llm, &self.config.ranker);

        let run = AnalysisRun {
            run_id,
            started_at,
            trigger,
            scope,
            snapshot_id: snapshot.id,
            snapshot_complete: snapshot.is_complete(),
            missing_sections: snapshot.missing_sections.clone(),
            recommendation_ids: recommendations.iter().map(|r| r.id).collect(),
            provider: self.adapter.as_ref().map(|a| a.provider_name().to_string()),
            enrichment,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        let persistence = match self.store.persist(&run, &recommendations).await {
            Ok(_) => {
                let current = self
                    .store
                    .current_recommendations(&RecommendationFilter::default())
                    .await;
                let statuses: HashMap<Uuid, Status> =
                    current.iter().map(|r| (r.id, r.status)).collect();
                for rec in &mut recommendations {
                    if let Some(status) = statuses.get(&rec.id) {
                        rec.status = *status;
                    }
                }
                self.refresh_active_gauges(&current);
                PersistenceOutcome::Saved
            }
            Err(err) => {
                error!(%run_id, error = %err, "analysis ran but results were not saved");
                PersistenceOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };

        let outcome = match persistence {
            PersistenceOutcome::Saved => "completed",
            PersistenceOutcome::Failed { .. } => "unsaved",
        };
        self.metrics.record_run(trigger, outcome, started.elapsed());
        info!(
            %run_id,
            recommendations = recommendations.len(),
            snapshot_complete = run.snapshot_complete,
            enrichment = %run.enrichment,
            duration_ms = run.duration_ms,
            "analysis run finished"
        );

        Ok(RunReport {
            run,
            recommendations,
            persistence,
        })
    }

    async fn collect(&self, scope: &Scope) -> Result<MetricSnapshot, CollectionError> {
        collect_with_retry(
            self.source.as_ref(),
            scope,
            self.config.collector.max_retries,
            self.config.collector.retry_delay,
        )
        .await
    }

    async fn enrich(&self, snapshot: &MetricSnapshot) -> (Vec<Recommendation>, EnrichmentStatus) {
        let Some(adapter) = &self.adapter else {
            return (Vec::new(), EnrichmentStatus::NotAttempted);
        };
        let context = AnalysisContext::from_snapshot(snapshot, adapter.max_digests());
        let provider = adapter.provider_name().to_string();
        match adapter.analyze(&context).await {
            Ok(candidates) => {
                let status = EnrichmentStatus::Succeeded {
                    provider,
                    candidates: candidates.len(),
                };
                (candidates, status)
            }
            Err(err) => {
                warn!(error = %err, "llm enrichment skipped; using heuristic results only");
                let status = EnrichmentStatus::Skipped {
                    provider,
                    reason: err.skip_reason(),
                };
                (Vec::new(), status)
            }
        }
    }

    fn refresh_active_gauges(&self, current: &[Recommendation]) {
        let pending: Vec<Recommendation> = current
            .iter()
            .filter(|r| r.status == Status::Pending)
            .cloned()
            .collect();
        self.metrics.set_active_recommendations(&pending);
    }

    pub async fn list_recommendations(&self, filter: &RecommendationFilter) -> Vec<Recommendation> {
        self.store.current_recommendations(filter).await
    }

    pub async fn update_recommendation_status(
        &self,
        id: Uuid,
        status: Status,
    ) -> Result<(), EngineError> {
        self.store.mark_status(id, status).await?;
        let current = self
            .store
            .current_recommendations(&RecommendationFilter::default())
            .await;
        self.refresh_active_gauges(&current);
        Ok(())
    }

    /// Collect a snapshot without analyzing it.
    pub async fn get_snapshot(&self, scope: &Scope) -> Result<MetricSnapshot, EngineError> {
        Ok(self.collect(scope).await?)
    }

    pub async fn runs(&self, limit: usize) -> Vec<AnalysisRun> {
        self.store.runs(limit).await
    }
}
