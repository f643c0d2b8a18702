//! Read-only introspection of the monitored MySQL server.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{self, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::snapshot::{MetricSnapshot, MissingSection, Scope, Section};

mod catalog;
mod digests;
mod usage;
mod util;
mod variables;

pub use util::{Disposition, classify};

/// Failures that abort a collection. Anything else only marks a section missing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollectionError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl CollectionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollectionError::ConnectionLost(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CollectionError::ConnectionLost(_) => "connection_lost",
            CollectionError::PermissionDenied(_) => "permission_denied",
        }
    }
}

/// Produces a point-in-time snapshot for a scope.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn collect(&self, scope: &Scope) -> Result<MetricSnapshot, CollectionError>;
}

#[derive(Debug, Clone)]
pub struct CollectorLimits {
    pub max_tables: u32,
    pub max_columns: u32,
    pub max_indexes: u32,
    pub max_digests: u32,
    pub index_size_floor_bytes: i64,
    pub budget: Duration,
}

impl From<&AppConfig> for CollectorLimits {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_tables: config.limits.max_tables,
            max_columns: config.limits.max_columns,
            max_indexes: config.limits.max_indexes,
            max_digests: config.limits.max_digests,
            index_size_floor_bytes: config.limits.index_size_floor_bytes,
            budget: config.timeouts.collection_budget,
        }
    }
}

/// Collector backed by an explicit pool handle. Each collection runs all its
/// section queries on one acquired session.
#[derive(Clone)]
pub struct MySqlCollector {
    pool: DbPool,
    limits: CollectorLimits,
}

impl MySqlCollector {
    pub fn new(pool: DbPool, limits: CollectorLimits) -> Self {
        Self { pool, limits }
    }
}

/// Tracks the collection budget and which sections went missing.
struct SectionRunner {
    deadline: Instant,
    exhausted: bool,
    missing: Vec<MissingSection>,
}

impl SectionRunner {
    fn new(budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
            exhausted: false,
            missing: Vec::new(),
        }
    }

    async fn run<T, F>(&mut self, section: Section, query: F) -> Result<Option<T>, CollectionError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        if self.exhausted || Instant::now() >= self.deadline {
            self.exhausted = true;
            self.mark(section, "collection budget exhausted".into());
            return Ok(None);
        }

        match time::timeout_at(self.deadline, query).await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(err)) => match classify(&err).in_section(section) {
                Disposition::Abort(fatal) => Err(fatal),
                Disposition::Denied(reason) | Disposition::SkipSection(reason) => {
                    warn!(section = section.as_str(), %reason, "section unavailable");
                    self.mark(section, reason);
                    Ok(None)
                }
            },
            Err(_) => {
                warn!(section = section.as_str(), "collection budget exhausted");
                self.exhausted = true;
                self.mark(section, "collection budget exhausted".into());
                Ok(None)
            }
        }
    }

    fn mark(&mut self, section: Section, reason: String) {
        self.missing.push(MissingSection { section, reason });
    }
}

type IndexKey = (String, String, String);

fn index_key(schema: &str, table: &str, index: &str) -> IndexKey {
    (
        schema.to_lowercase(),
        table.to_lowercase(),
        index.to_lowercase(),
    )
}

#[async_trait]
impl SnapshotSource for MySqlCollector {
    #[instrument(skip_all, fields(scope = %scope))]
    async fn collect(&self, scope: &Scope) -> Result<MetricSnapshot, CollectionError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(util::classify_session)?;
        let limits = &self.limits;
        let mut runner = SectionRunner::new(limits.budget);

        let window = runner
            .run(Section::ServerStatus, usage::observation_window(&mut conn))
            .await?
            .flatten();
        let tables = runner
            .run(Section::Tables, catalog::tables(&mut conn, scope, limits))
            .await?;
        let columns = runner
            .run(Section::Columns, catalog::columns(&mut conn, scope, limits))
            .await?;
        let indexes = runner
            .run(Section::Indexes, catalog::indexes(&mut conn, scope, limits))
            .await?;
        let usage_rows = runner
            .run(Section::IndexUsage, usage::index_usage(&mut conn, scope, limits))
            .await?;
        let size_rows = runner
            .run(Section::IndexSizes, usage::index_sizes(&mut conn, scope, limits))
            .await?;
        let digests = runner
            .run(Section::Digests, digests::top_digests(&mut conn, scope, limits))
            .await?;
        let variables = runner
            .run(Section::GlobalVariables, variables::global_variables(&mut conn))
            .await?;

        if runner.exhausted {
            // A query may have been cut off mid-flight; do not hand the session back.
            conn.close_on_drop();
        }

        let mut indexes = indexes.unwrap_or_default();
        if let Some(rows) = &usage_rows {
            let by_key: HashMap<IndexKey, &usage::UsageRow> = rows
                .iter()
                .map(|r| (index_key(&r.schema, &r.table, &r.index), r))
                .collect();
            for index in &mut indexes {
                if let Some(row) = by_key.get(&index_key(&index.schema, &index.table, &index.index))
                {
                    index.read_count = Some(row.reads);
                    index.write_count = Some(row.writes);
                    index.usage_tracked = true;
                }
            }
        }
        if let Some(rows) = &size_rows {
            let by_key: HashMap<IndexKey, i64> = rows
                .iter()
                .map(|r| (index_key(&r.schema, &r.table, &r.index), r.bytes))
                .collect();
            for index in &mut indexes {
                index.size_bytes = by_key
                    .get(&index_key(&index.schema, &index.table, &index.index))
                    .copied();
            }
        }

        let snapshot = MetricSnapshot {
            id: Uuid::new_v4(),
            collected_at: Utc::now(),
            scope: scope.clone(),
            observation_window_secs: window,
            tables: tables.unwrap_or_default(),
            columns: columns.unwrap_or_default(),
            indexes,
            digests: digests.unwrap_or_default(),
            variables: variables.unwrap_or_default(),
            missing_sections: runner.missing,
        };

        info!(
            snapshot_id = %snapshot.id,
            tables = snapshot.tables.len(),
            indexes = snapshot.indexes.len(),
            digests = snapshot.digests.len(),
            missing = snapshot.missing_sections.len(),
            "snapshot collected"
        );
        Ok(snapshot)
    }
}

/// Collect, retrying connection-level failures up to `max_retries` times.
pub async fn collect_with_retry(
    source: &dyn SnapshotSource,
    scope: &Scope,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<MetricSnapshot, CollectionError> {
    let mut attempt = 0;
    loop {
        match source.collect(scope).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(err) if err.is_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(attempt, error = %err, "collection failed; retrying");
                time::sleep(retry_delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        error: CollectionError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SnapshotSource for Flaky {
        async fn collect(&self, scope: &Scope) -> Result<MetricSnapshot, CollectionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(MetricSnapshot::empty(scope.clone()))
            }
        }
    }

    #[tokio::test]
    async fn connection_loss_is_retried() {
        let source = Flaky {
            failures: 1,
            error: CollectionError::ConnectionLost("gone".into()),
            calls: AtomicU32::new(0),
        };
        let result = collect_with_retry(&source, &Scope::all(), 1, Duration::from_millis(1)).await;
        assert!(result.is_ok());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permission_errors_are_never_retried() {
        let source = Flaky {
            failures: 5,
            error: CollectionError::PermissionDenied("no grant".into()),
            calls: AtomicU32::new(0),
        };
        let err = collect_with_retry(&source, &Scope::all(), 3, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::PermissionDenied(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let source = Flaky {
            failures: 10,
            error: CollectionError::ConnectionLost("gone".into()),
            calls: AtomicU32::new(0),
        };
        assert!(
            collect_with_retry(&source, &Scope::all(), 2, Duration::from_millis(1))
                .await
                .is_err()
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn section_runner_marks_missing_and_stops_after_budget() {
        let mut runner = SectionRunner::new(Duration::from_millis(20));
        let slow = runner
            .run(Section::Tables, async {
                time::sleep(Duration::from_millis(200)).await;
                Ok::<_, sqlx::Error>(1)
            })
            .await
            .unwrap();
        assert!(slow.is_none());
        let next = runner
            .run(Section::Digests, async { Ok::<_, sqlx::Error>(2) })
            .await
            .unwrap();
        assert!(next.is_none());
        let sections: Vec<Section> = runner.missing.iter().map(|m| m.section).collect();
        assert_eq!(sections, vec![Section::Tables, Section::Digests]);
    }

    #[tokio::test]
    async fn section_runner_skips_decode_failures() {
        let mut runner = SectionRunner::new(Duration::from_secs(5));
        let value = runner
            .run(Section::Columns, async {
                Err::<i32, _>(sqlx::Error::ColumnNotFound("x".into()))
            })
            .await
            .unwrap();
        assert!(value.is_none());
        let ok = runner
            .run(Section::Indexes, async { Ok::<_, sqlx::Error>(3) })
            .await
            .unwrap();
        assert_eq!(ok, Some(3));
        assert_eq!(runner.missing.len(), 1);
    }
}
