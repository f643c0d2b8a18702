use sqlx::{MySqlConnection, Row};
use tracing::{debug, instrument};

use crate::analyzer::sql;
use crate::collector::CollectorLimits;
use crate::snapshot::{DigestEntry, Scope};

// Timers are picoseconds; 1e9 ps = 1 ms.
const DIGESTS_SQL: &str = r#"
SELECT
    CAST(d.DIGEST AS CHAR) AS digest,
    CAST(d.SCHEMA_NAME AS CHAR) AS schema_name,
    CAST(d.DIGEST_TEXT AS CHAR) AS digest_text,
    CAST(d.COUNT_STAR AS SIGNED) AS exec_count,
    CAST(d.SUM_TIMER_WAIT / 1000000000 AS DOUBLE) AS total_latency_ms,
    CAST(d.AVG_TIMER_WAIT / 1000000000 AS DOUBLE) AS avg_latency_ms,
    CAST(d.MIN_TIMER_WAIT / 1000000000 AS DOUBLE) AS min_latency_ms,
    CAST(d.MAX_TIMER_WAIT / 1000000000 AS DOUBLE) AS max_latency_ms,
    CAST(d.SUM_ROWS_EXAMINED AS SIGNED) AS rows_examined,
    CAST(d.SUM_ROWS_SENT AS SIGNED) AS rows_returned,
    CAST(d.SUM_ROWS_AFFECTED AS SIGNED) AS rows_affected,
    CAST(d.SUM_NO_INDEX_USED + d.SUM_NO_GOOD_INDEX_USED AS SIGNED) AS no_index_used
FROM performance_schema.events_statements_summary_by_digest d
WHERE d.DIGEST IS NOT NULL
  AND d.DIGEST_TEXT IS NOT NULL
  AND (d.SCHEMA_NAME IS NULL
       OR d.SCHEMA_NAME NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys'))
  AND (? = '' OR d.SCHEMA_NAME = ?)
  AND d.DIGEST_TEXT NOT LIKE 'SHOW%'
  AND d.DIGEST_TEXT NOT LIKE 'SET%'
  AND d.DIGEST_TEXT NOT LIKE 'EXPLAIN%'
  AND d.DIGEST_TEXT NOT LIKE 'SELECT @@%'
ORDER BY d.SUM_TIMER_WAIT DESC
LIMIT ?
"#;

#[instrument(skip_all)]
pub async fn top_digests(
    conn: &mut MySqlConnection,
    scope: &Scope,
    limits: &CollectorLimits,
) -> Result<Vec<DigestEntry>, sqlx::Error> {
    let schema = scope.schema_filter();
    let rows = sqlx::query(DIGESTS_SQL)
        .bind(schema.clone())
        .bind(schema)
        .bind(i64::from(limits.max_digests))
        .fetch_all(&mut *conn)
        .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let entry = DigestEntry {
            digest: row.try_get("digest")?,
            schema: row.try_get("schema_name")?,
            text: row.try_get("digest_text")?,
            exec_count: row.try_get::<Option<i64>, _>("exec_count")?.unwrap_or(0),
            total_latency_ms: row
                .try_get::<Option<f64>, _>("total_latency_ms")?
                .unwrap_or(0.0),
            avg_latency_ms: row
                .try_get::<Option<f64>, _>("avg_latency_ms")?
                .unwrap_or(0.0),
            min_latency_ms: row
                .try_get::<Option<f64>, _>("min_latency_ms")?
                .unwrap_or(0.0),
            max_latency_ms: row
                .try_get::<Option<f64>, _>("max_latency_ms")?
                .unwrap_or(0.0),
            rows_examined: row.try_get::<Option<i64>, _>("rows_examined")?.unwrap_or(0),
            rows_returned: row.try_get::<Option<i64>, _>("rows_returned")?.unwrap_or(0),
            rows_affected: row.try_get::<Option<i64>, _>("rows_affected")?.unwrap_or(0),
            no_index_used: row.try_get::<Option<i64>, _>("no_index_used")?.unwrap_or(0),
        };
        if touches_scope(&entry, scope) {
            entries.push(entry);
        }
    }

    debug!(digests = entries.len(), "collected statement digests");
    Ok(entries)
}

/// With a table filter, keep only digests that reference one of those tables.
fn touches_scope(entry: &DigestEntry, scope: &Scope) -> bool {
    if scope.tables.is_empty() {
        return true;
    }
    sql::parse(&entry.text).tables.iter().any(|table| {
        scope
            .tables
            .iter()
            .any(|wanted| wanted.eq_ignore_ascii_case(&table.table))
    })
}
