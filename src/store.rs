use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::persistence::{self, PersistedState, PersistenceError};
use crate::ranker;
use crate::recommendations::{AnalysisRun, Category, Recommendation, Severity, Status};

/// One persisted version of a recommendation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredRecommendation {
    pub recommendation: Recommendation,
    pub run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    /// Run whose newer record replaced this one.
    pub superseded_by: Option<Uuid>,
}

impl StoredRecommendation {
    pub fn is_current(&self) -> bool {
        self.superseded_by.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("analysis results were not saved: {0}")]
    Write(#[source] PersistenceError),
    #[error("failed to load stored results: {0}")]
    Load(#[source] PersistenceError),
    #[error("recommendation {0} not found")]
    NotFound(Uuid),
}

/// Narrows `current_recommendations`; empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendationFilter {
    pub category: Option<Category>,
    pub min_severity: Option<Severity>,
    pub status: Option<Status>,
    pub schema: Option<String>,
    pub table: Option<String>,
}

impl RecommendationFilter {
    pub fn pending() -> Self {
        Self {
            status: Some(Status::Pending),
            ..Self::default()
        }
    }

    fn matches(&self, rec: &Recommendation) -> bool {
        self.category.is_none_or(|c| rec.category == c)
            && self.min_severity.is_none_or(|s| rec.severity >= s)
            && self.status.is_none_or(|s| rec.status == s)
            && self
                .schema
                .as_deref()
                .is_none_or(|s| rec.target.schema.eq_ignore_ascii_case(s))
            && self
                .table
                .as_deref()
                .is_none_or(|t| rec.target.table.eq_ignore_ascii_case(t))
    }
}

/// Fingerprint-keyed recommendation history plus the append-only run audit.
///
/// Every mutation runs under one write lock. With a data directory the new
/// state is written to disk before it replaces the in-memory copy, so a failed
/// write leaves the store exactly as it was.
#[derive(Clone)]
pub struct ResultStore {
    inner: Arc<RwLock<PersistedState>>,
    data_dir: Option<PathBuf>,
}

impl ResultStore {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(RwLock::new(PersistedState::default())),
            data_dir: None,
        }
    }

    /// Open a file-backed store, restoring `<data_dir>/state.json` when present.
    pub async fn open(data_dir: PathBuf) -> Result<Self, StoreError> {
        let state = persistence::load_if_exists(&data_dir)
            .await
            .map_err(StoreError::Load)?
            .unwrap_or_default();
        Ok(Self {
            inner: Arc::new(RwLock::new(state)),
            data_dir: Some(data_dir),
        })
    }

    pub async fn from_config(data_dir: Option<PathBuf>) -> Result<Self, StoreError> {
        match data_dir {
            Some(dir) => Self::open(dir).await,
            None => {
                warn!("no data directory configured; recommendations are kept in memory only");
                Ok(Self::in_memory())
            }
        }
    }

    /// Record a run and its ranked recommendations.
    ///
    /// A fingerprint's previous current record is superseded by the new one.
    /// Dismissed fingerprints stay dismissed; applied ones come back as pending.
    pub async fn persist(
        &self,
        run: &AnalysisRun,
        recommendations: &[Recommendation],
    ) -> Result<Uuid, StoreError> {
        let mut guard = self.inner.write().await;
        let mut next = guard.clone();
        let recorded_at = Utc::now();

        for rec in recommendations {
            let mut rec = rec.clone();
            if let Some(previous) = next
                .recommendations
                .iter_mut()
                .rev()
                .find(|r| r.is_current() && r.recommendation.id == rec.id)
            {
                rec.status = match previous.recommendation.status {
                    Status::Dismissed => Status::Dismissed,
                    Status::Applied | Status::Pending => Status::Pending,
                };
                previous.superseded_by = Some(run.run_id);
            }
            next.recommendations.push(StoredRecommendation {
                recommendation: rec,
                run_id: run.run_id,
                recorded_at,
                superseded_by: None,
            });
        }
        next.runs.push(run.clone());

        self.flush(&next).await?;
        *guard = next;
        info!(
            run_id = %run.run_id,
            recommendations = recommendations.len(),
            "persisted analysis run"
        );
        Ok(run.run_id)
    }

    /// Latest record per fingerprint, in ranking order.
    pub async fn current_recommendations(
        &self,
        filter: &RecommendationFilter,
    ) -> Vec<Recommendation> {
        let guard = self.inner.read().await;
        let mut current: Vec<Recommendation> = guard
            .recommendations
            .iter()
            .filter(|r| r.is_current() && filter.matches(&r.recommendation))
            .map(|r| r.recommendation.clone())
            .collect();
        current.sort_by(ranker::compare);
        current
    }

    pub async fn mark_status(&self, id: Uuid, status: Status) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let mut next = guard.clone();
        let record = next
            .recommendations
            .iter_mut()
            .rev()
            .find(|r| r.is_current() && r.recommendation.id == id)
            .ok_or(StoreError::NotFound(id))?;
        record.recommendation.status = status;

        self.flush(&next).await?;
        *guard = next;
        info!(%id, %status, "recommendation status updated");
        Ok(())
    }

    /// Every stored version of one fingerprint, oldest first.
    pub async fn history(&self, id: Uuid) -> Vec<StoredRecommendation> {
        self.inner
            .read()
            .await
            .recommendations
            .iter()
            .filter(|r| r.recommendation.id == id)
            .cloned()
            .collect()
    }

    /// Most recent runs first.
    pub async fn runs(&self, limit: usize) -> Vec<AnalysisRun> {
        self.inner
            .read()
            .await
            .runs
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    async fn flush(&self, state: &PersistedState) -> Result<(), StoreError> {
        match &self.data_dir {
            Some(dir) => persistence::write_atomic(dir, state)
                .await
                .map_err(StoreError::Write),
            None => Ok(()),
        }
    }
}
