use crate::config::{AnalyzerConfig, SizeTiers};
use crate::recommendations::{Severity, clamp_confidence};

/// Multiplier on the table row estimate under which rows examined per execution
/// still count as consistent with the estimate.
const ROW_ESTIMATE_SLACK: f64 = 2.0;

pub fn severity_for_size(size_bytes: i64, tiers: &SizeTiers) -> Severity {
    if size_bytes >= tiers.critical_bytes {
        Severity::Critical
    } else if size_bytes >= tiers.high_bytes {
        Severity::High
    } else if size_bytes >= tiers.medium_bytes {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Confidence that a zero-read index is truly unused, penalised when the
/// statistics window is shorter than the configured minimum.
pub fn unused_confidence(window_secs: Option<i64>, config: &AnalyzerConfig) -> f64 {
    let min_window = config.min_observation_window.as_secs_f64();
    let coverage = match window_secs {
        Some(secs) if min_window > 0.0 => (secs.max(0) as f64 / min_window).min(1.0),
        Some(_) => 1.0,
        None => 0.0,
    };
    clamp_confidence(1.0 - config.short_window_penalty * (1.0 - coverage))
}

/// How much the row estimate can be trusted as evidence.
pub fn row_certainty(row_estimate: Option<i64>, examined_per_exec: f64) -> f64 {
    match row_estimate {
        None => 0.6,
        Some(rows) if examined_per_exec <= rows.max(0) as f64 * ROW_ESTIMATE_SLACK => 1.0,
        Some(_) => 0.8,
    }
}

/// Grows from `base` at one digest to 1.0 at `saturation` digests.
pub fn corroboration(supporting: usize, base: f64, saturation: usize) -> f64 {
    let span = saturation.saturating_sub(1).max(1) as f64;
    let growth = (supporting.saturating_sub(1) as f64 / span).min(1.0);
    clamp_confidence(base + (1.0 - base) * growth)
}

pub fn missing_index_confidence(
    row_estimate: Option<i64>,
    examined_per_exec: f64,
    supporting: usize,
    config: &AnalyzerConfig,
) -> f64 {
    clamp_confidence(
        row_certainty(row_estimate, examined_per_exec)
            * corroboration(
                supporting,
                config.confidence_base,
                config.confidence_saturation,
            ),
    )
}

pub fn missing_index_severity(rows: i64, ratio: f64) -> Severity {
    if rows >= 10_000_000 && ratio >= 10_000.0 {
        Severity::Critical
    } else if rows >= 1_000_000 && ratio >= 1_000.0 {
        Severity::High
    } else if rows >= 100_000 || ratio >= 1_000.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn size_tiers_map_to_severity() {
        let tiers = SizeTiers::default();
        assert_eq!(severity_for_size(2_i64 << 30, &tiers), Severity::Critical);
        assert_eq!(severity_for_size(200_i64 << 20, &tiers), Severity::High);
        assert_eq!(severity_for_size(20_i64 << 20, &tiers), Severity::Medium);
        assert_eq!(severity_for_size(2_i64 << 20, &tiers), Severity::Low);
    }

    #[test]
    fn unused_confidence_scales_with_window() {
        let config = AnalyzerConfig {
            min_observation_window: Duration::from_secs(100),
            short_window_penalty: 0.5,
            ..AnalyzerConfig::default()
        };
        assert!((unused_confidence(Some(100), &config) - 1.0).abs() < 1e-9);
        assert!((unused_confidence(Some(1_000), &config) - 1.0).abs() < 1e-9);
        assert!((unused_confidence(Some(50), &config) - 0.75).abs() < 1e-9);
        assert!((unused_confidence(None, &config) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn corroboration_saturates() {
        assert!((corroboration(1, 0.5, 10) - 0.5).abs() < 1e-9);
        assert!((corroboration(10, 0.5, 10) - 1.0).abs() < 1e-9);
        assert!((corroboration(50, 0.5, 10) - 1.0).abs() < 1e-9);
        assert!(corroboration(5, 0.5, 10) > corroboration(2, 0.5, 10));
    }

    #[test]
    fn row_certainty_prefers_consistent_estimates() {
        assert_eq!(row_certainty(Some(1_000_000), 100_000.0), 1.0);
        assert_eq!(row_certainty(Some(1_000), 100_000.0), 0.8);
        assert_eq!(row_certainty(None, 10.0), 0.6);
    }

    #[test]
    fn missing_index_severity_thresholds() {
        assert_eq!(missing_index_severity(20_000_000, 50_000.0), Severity::Critical);
        assert_eq!(missing_index_severity(1_000_000, 10_000.0), Severity::High);
        assert_eq!(missing_index_severity(200_000, 150.0), Severity::Medium);
        assert_eq!(missing_index_severity(5_000, 2_000.0), Severity::Medium);
        assert_eq!(missing_index_severity(5_000, 150.0), Severity::Low);
    }
}
