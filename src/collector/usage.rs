use sqlx::{MySqlConnection, Row};
use tracing::instrument;

use crate::collector::CollectorLimits;
use crate::collector::util::scoped;
use crate::snapshot::Scope;

const UPTIME_SQL: &str = r#"
SELECT CAST(VARIABLE_VALUE AS SIGNED) AS uptime
FROM performance_schema.global_status
WHERE VARIABLE_NAME = 'Uptime'
"#;

const INDEX_USAGE_SQL: &str = r#"
SELECT
    CAST(u.OBJECT_SCHEMA AS CHAR) AS table_schema,
    CAST(u.OBJECT_NAME AS CHAR) AS table_name,
    CAST(u.INDEX_NAME AS CHAR) AS index_name,
    CAST(u.COUNT_READ AS SIGNED) AS read_count,
    CAST(u.COUNT_WRITE AS SIGNED) AS write_count
FROM performance_schema.table_io_waits_summary_by_index_usage u
WHERE u.INDEX_NAME IS NOT NULL
  AND u.OBJECT_TYPE = 'TABLE'
  AND u.OBJECT_SCHEMA NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')
  AND (? = '' OR u.OBJECT_SCHEMA = ?)
  AND (? = '' OR FIND_IN_SET(u.OBJECT_NAME, ?) > 0)
ORDER BY u.OBJECT_SCHEMA, u.OBJECT_NAME, u.INDEX_NAME
LIMIT ?
"#;

const INDEX_SIZES_SQL: &str = r#"
SELECT
    CAST(st.database_name AS CHAR) AS table_schema,
    CAST(st.table_name AS CHAR) AS table_name,
    CAST(st.index_name AS CHAR) AS index_name,
    CAST(st.stat_value * @@innodb_page_size AS SIGNED) AS size_bytes
FROM mysql.innodb_index_stats st
WHERE st.stat_name = 'size'
  AND (? = '' OR st.database_name = ?)
  AND (? = '' OR FIND_IN_SET(st.table_name, ?) > 0)
  AND st.stat_value * @@innodb_page_size >= ?
ORDER BY st.stat_value DESC
LIMIT ?
"#;

#[derive(Debug, Clone)]
pub struct UsageRow {
    pub schema: String,
    pub table: String,
    pub index: String,
    pub reads: i64,
    pub writes: i64,
}

#[derive(Debug, Clone)]
pub struct SizeRow {
    pub schema: String,
    pub table: String,
    pub index: String,
    pub bytes: i64,
}

/// Seconds the server has been accumulating statistics.
#[instrument(skip_all)]
pub async fn observation_window(conn: &mut MySqlConnection) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query(UPTIME_SQL).fetch_optional(&mut *conn).await?;
    match row {
        Some(row) => row.try_get::<Option<i64>, _>("uptime"),
        None => Ok(None),
    }
}

#[instrument(skip_all)]
pub async fn index_usage(
    conn: &mut MySqlConnection,
    scope: &Scope,
    limits: &CollectorLimits,
) -> Result<Vec<UsageRow>, sqlx::Error> {
    let rows = scoped(INDEX_USAGE_SQL, scope, limits.max_indexes)
        .fetch_all(&mut *conn)
        .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let reads: Option<i64> = row.try_get("read_count")?;
        let writes: Option<i64> = row.try_get("write_count")?;
        entries.push(UsageRow {
            schema: row.try_get("table_schema")?,
            table: row.try_get("table_name")?,
            index: row.try_get("index_name")?,
            reads: reads.unwrap_or(0),
            writes: writes.unwrap_or(0),
        });
    }
    Ok(entries)
}

#[instrument(skip_all)]
pub async fn index_sizes(
    conn: &mut MySqlConnection,
    scope: &Scope,
    limits: &CollectorLimits,
) -> Result<Vec<SizeRow>, sqlx::Error> {
    let schema = scope.schema_filter();
    let tables = scope.tables_filter();
    let rows = sqlx::query(INDEX_SIZES_SQL)
        .bind(schema.clone())
        .bind(schema)
        .bind(tables.clone())
        .bind(tables)
        .bind(limits.index_size_floor_bytes)
        .bind(i64::from(limits.max_indexes))
        .fetch_all(&mut *conn)
        .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let bytes: Option<i64> = row.try_get("size_bytes")?;
        entries.push(SizeRow {
            schema: row.try_get("table_schema")?,
            table: row.try_get("table_name")?,
            index: row.try_get("index_name")?,
            bytes: bytes.unwrap_or(0),
        });
    }
    Ok(entries)
}
