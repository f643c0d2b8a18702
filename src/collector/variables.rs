use std::collections::BTreeMap;

use sqlx::{MySqlConnection, Row};
use tracing::instrument;

const GLOBAL_VARIABLES_SQL: &str = r#"
SELECT
    CAST(VARIABLE_NAME AS CHAR) AS variable_name,
    CAST(VARIABLE_VALUE AS CHAR) AS variable_value
FROM performance_schema.global_variables
WHERE VARIABLE_NAME IN (
    'innodb_buffer_pool_size',
    'tmp_table_size',
    'max_heap_table_size',
    'max_connections',
    'innodb_redo_log_capacity',
    'innodb_log_file_size'
)
"#;

/// Server settings the configuration rules read.
#[instrument(skip_all)]
pub async fn global_variables(
    conn: &mut MySqlConnection,
) -> Result<BTreeMap<String, String>, sqlx::Error> {
    let rows = sqlx::query(GLOBAL_VARIABLES_SQL)
        .fetch_all(&mut *conn)
        .await?;
    rows.into_iter()
        .map(|row| {
            let name: String = row.try_get("variable_name")?;
            let value: Option<String> = row.try_get("variable_value")?;
            Ok((name.to_ascii_lowercase(), value.unwrap_or_default()))
        })
        .collect()
}
