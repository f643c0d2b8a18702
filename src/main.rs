use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenvy::Error as DotenvError;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dblens::app::AppContext;
use dblens::collector::{CollectorLimits, MySqlCollector};
use dblens::config::{self, AppConfig};
use dblens::engine::AnalysisEngine;
use dblens::llm::LlmAdapter;
use dblens::metrics::AppMetrics;
use dblens::recommendations::{Category, Severity, Status, Trigger};
use dblens::snapshot::Scope;
use dblens::state::SharedState;
use dblens::store::{RecommendationFilter, ResultStore};
use dblens::{db, http, scheduler};

#[derive(Debug, Parser)]
#[command(author, version, about = "dblens: index and slow-query recommendations for MySQL")]
struct Cli {
    /// Path to YAML configuration file. Defaults to env DBLENS_CONFIG or built-in defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one analysis and print the report.
    Run(ScopeArgs),
    /// List current recommendations.
    List(ListArgs),
    /// Mark a recommendation applied, dismissed or pending.
    SetStatus {
        id: Uuid,
        status: Status,
    },
    /// Collect and print a metadata snapshot without analyzing it.
    Snapshot(ScopeArgs),
    /// Show recent analysis runs, newest first.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run scheduled analyses and serve /healthz and /metrics.
    Watch,
}

#[derive(Debug, Args)]
struct ScopeArgs {
    #[arg(long)]
    schema: Option<String>,
    /// Restrict to these tables; repeat the flag for several.
    #[arg(long = "table")]
    tables: Vec<String>,
}

impl ScopeArgs {
    fn into_scope(self) -> Scope {
        Scope {
            schema: self.schema,
            tables: self.tables,
        }
    }
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    category: Option<Category>,
    /// Minimum severity.
    #[arg(long)]
    severity: Option<Severity>,
    #[arg(long)]
    status: Option<Status>,
    #[arg(long)]
    schema: Option<String>,
    #[arg(long)]
    table: Option<String>,
}

impl From<ListArgs> for RecommendationFilter {
    fn from(args: ListArgs) -> Self {
        Self {
            category: args.category,
            min_severity: args.severity,
            status: args.status,
            schema: args.schema,
            table: args.table,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = Arc::new(config::load_config(cli.config.as_deref())?);
    let store = ResultStore::from_config(config.storage.data_dir.clone()).await?;

    match cli.command {
        Command::Run(scope) => {
            let engine = build_engine(&config, store, AppMetrics::new()?).await?;
            let report = engine
                .run_analysis(scope.into_scope(), Trigger::Manual)
                .await?;
            print_json(&report)
        }
        Command::List(args) => {
            let filter = RecommendationFilter::from(args);
            print_json(&store.current_recommendations(&filter).await)
        }
        Command::SetStatus { id, status } => {
            store.mark_status(id, status).await?;
            print_json(&serde_json::json!({ "id": id, "status": status }))
        }
        Command::Snapshot(scope) => {
            let engine = build_engine(&config, store, AppMetrics::new()?).await?;
            print_json(&engine.get_snapshot(&scope.into_scope()).await?)
        }
        Command::Runs { limit } => print_json(&store.runs(limit).await),
        Command::Watch => watch(config, store).await,
    }
}

async fn build_engine(
    config: &Arc<AppConfig>,
    store: ResultStore,
    metrics: AppMetrics,
) -> Result<AnalysisEngine> {
    config::require_dsn(config)?;
    let pool = db::create_pool(config).await?;
    let collector = MySqlCollector::new(pool, CollectorLimits::from(config.as_ref()));
    let adapter = LlmAdapter::from_config(&config.llm).context("failed to set up llm provider")?;
    Ok(
        AnalysisEngine::new(Arc::new(collector), store, Arc::clone(config), metrics)
            .with_adapter(adapter),
    )
}

async fn watch(config: Arc<AppConfig>, store: ResultStore) -> Result<()> {
    let bind_addr: SocketAddr = config
        .http
        .bind
        .parse()
        .context("invalid http.bind address")?;

    let metrics = AppMetrics::new()?;
    let engine = build_engine(&config, store, metrics.clone()).await?;
    let ctx = AppContext::new(config, engine, metrics, SharedState::new());

    let scheduler_handle = scheduler::spawn(ctx.clone());
    let router = http::create_router(ctx.clone());

    info!(cluster = ctx.cluster_name(), "dblens listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind HTTP listener")?;

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = ?err, "server terminated with error");
    }

    scheduler_handle.abort();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}

fn load_env() {
    if let Err(err) = dotenvy::dotenv() {
        match err {
            DotenvError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {}
            other => eprintln!("warning: failed to load .env file: {other}"),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dblens=info,axum::rejection=trace"));
    // stdout carries the JSON output of the subcommands.
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = ?err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
