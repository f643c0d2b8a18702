use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::app::AppContext;
use crate::config::AppConfig;
use crate::engine::{EngineError, PersistenceOutcome};
use crate::recommendations::Trigger;

pub const ANALYSIS_LOOP: &str = "scheduled_analysis";

pub const LOOP_NAMES: &[&str] = &[ANALYSIS_LOOP];

/// Wall-time expected for one tick: every scope's collection budget plus
/// the LLM time limit.
pub fn tick_budget(config: &AppConfig) -> Duration {
    let per_scope = config.timeouts.collection_budget + config.llm.timeout;
    let scopes = u32::try_from(config.schedule.effective_scopes().len()).unwrap_or(u32::MAX);
    per_scope.saturating_mul(scopes)
}

/// How long `/healthz` tolerates the loop going without a successful tick.
pub fn readiness_window(config: &AppConfig) -> Duration {
    config.schedule.interval.saturating_mul(2) + tick_budget(config)
}

/// Spawn the scheduled-analysis loop.
pub fn spawn(ctx: AppContext) -> JoinHandle<()> {
    let interval = ctx.config.schedule.interval;
    let budget = tick_budget(&ctx.config);

    tokio::spawn(async move {
        info!(
            loop_name = ANALYSIS_LOOP,
            interval = ?interval,
            budget = ?budget,
            "starting scheduler loop"
        );

        // The first tick completes immediately, so a run happens at startup.
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(err) = tick_once(&ctx, budget).await {
                error!(loop_name = ANALYSIS_LOOP, error = ?err, "scheduler iteration failed");
            }
        }
    })
}

async fn tick_once(ctx: &AppContext, budget: Duration) -> Result<()> {
    let start = Instant::now();
    match run_scopes(ctx).await {
        Ok(()) => {
            let elapsed = start.elapsed();
            ctx.metrics.observe_duration(ANALYSIS_LOOP, elapsed);
            if elapsed > budget {
                warn!(
                    loop_name = ANALYSIS_LOOP,
                    elapsed = ?elapsed,
                    budget = ?budget,
                    "loop exceeded budget"
                );
            } else {
                info!(loop_name = ANALYSIS_LOOP, elapsed = ?elapsed, "loop completed successfully");
            }
            ctx.metrics.record_success(ANALYSIS_LOOP, true);
            ctx.state.record_loop_success(ANALYSIS_LOOP).await;
            Ok(())
        }
        Err(err) => {
            ctx.metrics.observe_duration(ANALYSIS_LOOP, start.elapsed());
            ctx.metrics.record_success(ANALYSIS_LOOP, false);
            ctx.metrics.inc_error(ANALYSIS_LOOP);
            ctx.state
                .record_loop_failure(ANALYSIS_LOOP, err.to_string())
                .await;
            Err(err)
        }
    }
}

/// Analyze every configured scope in turn. A scope that is already running
/// (for example a manual run) is skipped, not counted as a failure.
async fn run_scopes(ctx: &AppContext) -> Result<()> {
    let mut failures = Vec::new();
    for scope in ctx.config.schedule.effective_scopes() {
        match ctx.engine.run_analysis(scope.clone(), Trigger::Scheduled).await {
            Ok(report) => {
                if let PersistenceOutcome::Failed { error } = report.persistence {
                    failures.push(format!("{scope}: results not saved: {error}"));
                }
            }
            Err(EngineError::Busy(key)) => {
                info!(scope = %key, "scope already being analyzed; skipping this tick");
            }
            Err(err) => failures.push(format!("{scope}: {err}")),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(failures.join("; ")))
    }
}
