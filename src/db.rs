use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use tracing::{error, info};

use crate::config::AppConfig;

pub type DbPool = MySqlPool;

/// Build a connection pool configured for read-only introspection.
pub async fn create_pool(config: &AppConfig) -> Result<DbPool> {
    let connect_options =
        MySqlConnectOptions::from_str(&config.dsn).context("invalid MySQL DSN supplied")?;
    let statement_timeout_ms = config.timeouts.statement_timeout_ms;

    let pool = MySqlPoolOptions::new()
        .max_connections(4)
        .min_connections(1)
        .acquire_timeout(config.timeouts.acquire)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET SESSION TRANSACTION READ ONLY")
                    .execute(&mut *conn)
                    .await
                    .map_err(|err| {
                        error!(error = ?err, "failed to enforce read-only session");
                        err
                    })?;
                sqlx::query(&format!(
                    "SET SESSION max_execution_time = {statement_timeout_ms}"
                ))
                .execute(&mut *conn)
                .await
                .map_err(|err| {
                    error!(error = ?err, "failed to set statement timeout");
                    err
                })?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await
        .context("failed to connect to mysql")?;

    if config.security.read_only_enforce {
        verify_read_only(&pool).await?;
    }

    info!("connected to cluster {}", config.cluster);
    Ok(pool)
}

/// Refuse to run on a session that would accept writes.
async fn verify_read_only(pool: &DbPool) -> Result<()> {
    let (read_only,): (i64,) =
        sqlx::query_as("SELECT CAST(@@SESSION.transaction_read_only AS SIGNED)")
            .fetch_one(pool)
            .await
            .context("dblens requires a read-only session")?;

    if read_only != 1 {
        anyhow::bail!("session is not read-only; refused to start");
    }

    Ok(())
}
