use sqlx::{MySqlConnection, Row};
use tracing::instrument;

use crate::collector::CollectorLimits;
use crate::collector::util::{scoped, split_columns};
use crate::snapshot::{ColumnStats, IndexStats, Scope, TableStats};

const TABLES_SQL: &str = r#"
SELECT
    CAST(t.TABLE_SCHEMA AS CHAR) AS table_schema,
    CAST(t.TABLE_NAME AS CHAR) AS table_name,
    CAST(t.TABLE_ROWS AS SIGNED) AS table_rows,
    CAST(COALESCE(t.DATA_LENGTH, 0) AS SIGNED) AS data_bytes,
    CAST(COALESCE(t.INDEX_LENGTH, 0) AS SIGNED) AS index_bytes
FROM information_schema.TABLES t
WHERE t.TABLE_TYPE = 'BASE TABLE'
  AND t.TABLE_SCHEMA NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')
  AND (? = '' OR t.TABLE_SCHEMA = ?)
  AND (? = '' OR FIND_IN_SET(t.TABLE_NAME, ?) > 0)
ORDER BY COALESCE(t.DATA_LENGTH, 0) + COALESCE(t.INDEX_LENGTH, 0) DESC
LIMIT ?
"#;

const COLUMNS_SQL: &str = r#"
SELECT
    CAST(c.TABLE_SCHEMA AS CHAR) AS table_schema,
    CAST(c.TABLE_NAME AS CHAR) AS table_name,
    CAST(c.COLUMN_NAME AS CHAR) AS column_name,
    CAST(c.DATA_TYPE AS CHAR) AS data_type,
    CAST(c.IS_NULLABLE = 'YES' AS SIGNED) AS nullable
FROM information_schema.COLUMNS c
WHERE c.TABLE_SCHEMA NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')
  AND (? = '' OR c.TABLE_SCHEMA = ?)
  AND (? = '' OR FIND_IN_SET(c.TABLE_NAME, ?) > 0)
ORDER BY c.TABLE_SCHEMA, c.TABLE_NAME, c.ORDINAL_POSITION
LIMIT ?
"#;

const INDEXES_SQL: &str = r#"
SELECT
    CAST(s.TABLE_SCHEMA AS CHAR) AS table_schema,
    CAST(s.TABLE_NAME AS CHAR) AS table_name,
    CAST(s.INDEX_NAME AS CHAR) AS index_name,
    CAST(GROUP_CONCAT(COALESCE(s.COLUMN_NAME, CONCAT('(', s.EXPRESSION, ')'))
        ORDER BY s.SEQ_IN_INDEX SEPARATOR ',') AS CHAR) AS index_columns,
    CAST(MAX(s.NON_UNIQUE) AS SIGNED) AS non_unique
FROM information_schema.STATISTICS s
WHERE s.TABLE_SCHEMA NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')
  AND (? = '' OR s.TABLE_SCHEMA = ?)
  AND (? = '' OR FIND_IN_SET(s.TABLE_NAME, ?) > 0)
GROUP BY s.TABLE_SCHEMA, s.TABLE_NAME, s.INDEX_NAME
ORDER BY s.TABLE_SCHEMA, s.TABLE_NAME, s.INDEX_NAME
LIMIT ?
"#;

#[instrument(skip_all)]
pub async fn tables(
    conn: &mut MySqlConnection,
    scope: &Scope,
    limits: &CollectorLimits,
) -> Result<Vec<TableStats>, sqlx::Error> {
    let rows = scoped(TABLES_SQL, scope, limits.max_tables)
        .fetch_all(&mut *conn)
        .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        entries.push(TableStats {
            schema: row.try_get("table_schema")?,
            table: row.try_get("table_name")?,
            row_estimate: row.try_get("table_rows")?,
            data_bytes: row.try_get("data_bytes")?,
            index_bytes: row.try_get("index_bytes")?,
        });
    }
    Ok(entries)
}

#[instrument(skip_all)]
pub async fn columns(
    conn: &mut MySqlConnection,
    scope: &Scope,
    limits: &CollectorLimits,
) -> Result<Vec<ColumnStats>, sqlx::Error> {
    let rows = scoped(COLUMNS_SQL, scope, limits.max_columns)
        .fetch_all(&mut *conn)
        .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let nullable: Option<i64> = row.try_get("nullable")?;
        entries.push(ColumnStats {
            schema: row.try_get("table_schema")?,
            table: row.try_get("table_name")?,
            column: row.try_get("column_name")?,
            data_type: row.try_get("data_type")?,
            nullable: nullable.unwrap_or(0) != 0,
        });
    }
    Ok(entries)
}

/// Index structure only; usage and size are joined in by the collector.
#[instrument(skip_all)]
pub async fn indexes(
    conn: &mut MySqlConnection,
    scope: &Scope,
    limits: &CollectorLimits,
) -> Result<Vec<IndexStats>, sqlx::Error> {
    let rows = scoped(INDEXES_SQL, scope, limits.max_indexes)
        .fetch_all(&mut *conn)
        .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let index: String = row.try_get("index_name")?;
        let columns: Option<String> = row.try_get("index_columns")?;
        let non_unique: Option<i64> = row.try_get("non_unique")?;
        let primary = index.eq_ignore_ascii_case("PRIMARY");
        entries.push(IndexStats {
            schema: row.try_get("table_schema")?,
            table: row.try_get("table_name")?,
            columns: split_columns(columns.as_deref().unwrap_or_default()),
            unique: primary || non_unique == Some(0),
            primary,
            index,
            size_bytes: None,
            read_count: None,
            write_count: None,
            usage_tracked: false,
        });
    }
    Ok(entries)
}
