//! Deterministic rules over a [`MetricSnapshot`].

pub mod configuration;
pub mod missing;
pub mod redundant;
pub mod scoring;
pub mod sql;
pub mod unused;

use crate::config::AnalyzerConfig;
use crate::recommendations::Recommendation;
use crate::snapshot::MetricSnapshot;

/// Run every heuristic rule family against a snapshot.
///
/// Pure: the same snapshot and configuration always yield the same candidates
/// in the same order. Sections missing from a partial snapshot disable the
/// rules that depend on them.
pub fn analyze(snapshot: &MetricSnapshot, config: &AnalyzerConfig) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    recommendations.extend(unused::detect(snapshot, config));
    recommendations.extend(redundant::detect(snapshot, config));
    recommendations.extend(missing::detect(snapshot, config));
    recommendations.extend(configuration::detect(snapshot, config));

    recommendations
}
