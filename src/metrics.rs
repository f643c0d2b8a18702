use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::recommendations::{Category, EnrichmentStatus, Recommendation, Severity, Trigger};

/// Registry and collectors exposed on `/metrics`.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Arc<Registry>,
    loops: LoopMetrics,
    runs: RunMetrics,
    recommendations: RecommendationMetrics,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("dblens".into()), None)?;
        let loops = LoopMetrics::register(&registry)?;
        let runs = RunMetrics::register(&registry)?;
        let recommendations = RecommendationMetrics::register(&registry)?;

        Ok(Self {
            registry: Arc::new(registry),
            loops,
            runs,
            recommendations,
        })
    }

    pub fn observe_duration(&self, loop_name: &str, duration: Duration) {
        self.loops
            .scrape_duration
            .with_label_values(&[loop_name])
            .observe(duration.as_secs_f64());
    }

    pub fn record_success(&self, loop_name: &str, success: bool) {
        self.loops
            .last_success
            .with_label_values(&[loop_name])
            .set(i64::from(success));
    }

    pub fn inc_error(&self, loop_name: &str) {
        self.loops
            .errors_total
            .with_label_values(&[loop_name])
            .inc();
    }

    /// `outcome` is one of `completed`, `unsaved`, `busy` or `failed`.
    pub fn record_run(&self, trigger: Trigger, outcome: &str, duration: Duration) {
        self.runs
            .runs_total
            .with_label_values(&[trigger.as_str(), outcome])
            .inc();
        self.runs
            .run_duration
            .with_label_values(&[trigger.as_str()])
            .observe(duration.as_secs_f64());
    }

    pub fn inc_collection_failure(&self, kind: &str) {
        self.runs
            .collection_failures
            .with_label_values(&[kind])
            .inc();
    }

    pub fn set_missing_sections(&self, count: usize) {
        self.runs
            .missing_sections
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn record_enrichment(&self, status: &EnrichmentStatus) {
        let reason = match status {
            EnrichmentStatus::Skipped { reason, .. } => reason.as_str(),
            _ => "",
        };
        self.runs
            .enrichment_total
            .with_label_values(&[status.label(), reason])
            .inc();
    }

    /// Replace the active-recommendation gauges with counts from `current`.
    pub fn set_active_recommendations(&self, current: &[Recommendation]) {
        let gauge = &self.recommendations.active;
        gauge.reset();
        for category in Category::ALL {
            for severity in Severity::ALL {
                let count = current
                    .iter()
                    .filter(|r| r.category == category && r.severity == severity)
                    .count();
                if count > 0 {
                    gauge
                        .with_label_values(&[category.as_str(), severity.as_str()])
                        .set(i64::try_from(count).unwrap_or(i64::MAX));
                }
            }
        }
    }

    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct LoopMetrics {
    scrape_duration: HistogramVec,
    last_success: IntGaugeVec,
    errors_total: IntCounterVec,
}

impl LoopMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let scrape_duration = HistogramVec::new(
            HistogramOpts::new("loop_duration_seconds", "Scheduler loop execution duration"),
            &["loop"],
        )?;
        registry.register(Box::new(scrape_duration.clone()))?;

        let last_success = IntGaugeVec::new(
            Opts::new(
                "loop_last_success",
                "Loop success flag (1=success, 0=failure)",
            ),
            &["loop"],
        )?;
        registry.register(Box::new(last_success.clone()))?;

        let errors_total =
            IntCounterVec::new(Opts::new("loop_errors_total", "Total loop errors"), &["loop"])?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            scrape_duration,
            last_success,
            errors_total,
        })
    }
}

#[derive(Clone)]
struct RunMetrics {
    runs_total: IntCounterVec,
    run_duration: HistogramVec,
    collection_failures: IntCounterVec,
    missing_sections: IntGauge,
    enrichment_total: IntCounterVec,
}

impl RunMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let runs_total = IntCounterVec::new(
            Opts::new("analysis_runs_total", "Analysis runs by trigger and outcome"),
            &["trigger", "outcome"],
        )?;
        registry.register(Box::new(runs_total.clone()))?;

        let run_duration = HistogramVec::new(
            HistogramOpts::new("analysis_run_duration_seconds", "Analysis run wall time")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["trigger"],
        )?;
        registry.register(Box::new(run_duration.clone()))?;

        let collection_failures = IntCounterVec::new(
            Opts::new(
                "collection_failures_total",
                "Collections aborted after retries, by failure kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(collection_failures.clone()))?;

        let missing_sections = IntGauge::new(
            "snapshot_missing_sections",
            "Sections missing from the most recent snapshot",
        )?;
        registry.register(Box::new(missing_sections.clone()))?;

        let enrichment_total = IntCounterVec::new(
            Opts::new("llm_enrichment_total", "LLM enrichment outcomes"),
            &["status", "reason"],
        )?;
        registry.register(Box::new(enrichment_total.clone()))?;

        Ok(Self {
            runs_total,
            run_duration,
            collection_failures,
            missing_sections,
            enrichment_total,
        })
    }
}

#[derive(Clone)]
struct RecommendationMetrics {
    active: IntGaugeVec,
}

impl RecommendationMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let active = IntGaugeVec::new(
            Opts::new(
                "recommendations_active",
                "Current pending recommendations by category and severity",
            ),
            &["category", "severity"],
        )?;
        registry.register(Box::new(active.clone()))?;
        Ok(Self { active })
    }
}
