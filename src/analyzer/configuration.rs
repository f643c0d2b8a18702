use tracing::debug;

use crate::config::AnalyzerConfig;
use crate::recommendations::{
    Category, Recommendation, Severity, Source, SuggestedAction, Target, format_bytes,
    format_number,
};
use crate::snapshot::{MetricSnapshot, Section};

const SETTING_CONFIDENCE: f64 = 0.9;
const WORKING_SET_CONFIDENCE: f64 = 0.6;
const PRIMARY_KEY_CONFIDENCE: f64 = 0.9;
const LARGE_TABLE_CONFIDENCE: f64 = 0.5;

/// Server settings and table shapes that hurt every query on the server.
pub fn detect(snapshot: &MetricSnapshot, config: &AnalyzerConfig) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();
    if snapshot.is_missing(Section::GlobalVariables) {
        debug!("global variables unavailable; skipping server setting checks");
    } else {
        recommendations.extend(buffer_pool(snapshot, config));
        recommendations.extend(tmp_table(snapshot, config));
    }
    if !snapshot.is_missing(Section::Tables) {
        if !snapshot.is_missing(Section::Indexes) {
            recommendations.extend(missing_primary_keys(snapshot, config));
        }
        recommendations.extend(large_tables(snapshot, config));
    }
    recommendations
}

fn buffer_pool(snapshot: &MetricSnapshot, config: &AnalyzerConfig) -> Option<Recommendation> {
    let size = snapshot.variable_i64("innodb_buffer_pool_size")?;
    let working_set: i64 = snapshot
        .tables
        .iter()
        .map(|t| t.data_bytes.max(0) + t.index_bytes.max(0))
        .sum();

    let (severity, confidence, rationale) = if size < config.min_buffer_pool_bytes {
        (
            Severity::High,
            SETTING_CONFIDENCE,
            format!(
                "innodb_buffer_pool_size is {}, below the {} floor; most reads go to disk.",
                format_bytes(size),
                format_bytes(config.min_buffer_pool_bytes)
            ),
        )
    } else if working_set > size {
        (
            Severity::Medium,
            WORKING_SET_CONFIDENCE,
            format!(
                "innodb_buffer_pool_size is {} while the analyzed tables and indexes hold {}; \
                 the hot set may not stay cached.",
                format_bytes(size),
                format_bytes(working_set)
            ),
        )
    } else {
        return None;
    };

    Some(Recommendation::new(
        Category::Configuration,
        severity,
        confidence,
        rationale,
        Some(SuggestedAction::Note(
            "Raise innodb_buffer_pool_size to at least 512 MiB, or about 70% of memory on a \
             dedicated database host."
                .into(),
        )),
        Source::Heuristic,
        Target::server_variable("innodb_buffer_pool_size"),
    ))
}

/// In-memory temporary tables are capped by the smaller of the two settings.
fn tmp_table(snapshot: &MetricSnapshot, config: &AnalyzerConfig) -> Option<Recommendation> {
    let tmp = snapshot.variable_i64("tmp_table_size")?;
    let (variable, effective) = match snapshot.variable_i64("max_heap_table_size") {
        Some(heap) if heap < tmp => ("max_heap_table_size", heap),
        _ => ("tmp_table_size", tmp),
    };
    if effective >= config.min_tmp_table_bytes {
        return None;
    }
    Some(Recommendation::new(
        Category::Configuration,
        Severity::Medium,
        SETTING_CONFIDENCE,
        format!(
            "In-memory temporary tables are capped at {} by {variable}; larger sorts and \
             GROUP BY results spill to disk.",
            format_bytes(effective)
        ),
        Some(SuggestedAction::Note(
            "Raise tmp_table_size and max_heap_table_size together to at least 64 MiB.".into(),
        )),
        Source::Heuristic,
        Target::server_variable(variable),
    ))
}

fn missing_primary_keys(snapshot: &MetricSnapshot, config: &AnalyzerConfig) -> Vec<Recommendation> {
    snapshot
        .tables
        .iter()
        .filter(|t| t.row_estimate.is_some_and(|rows| rows > config.primary_key_min_rows))
        .filter(|t| !snapshot.indexes_of(&t.schema, &t.table).any(|i| i.primary))
        .map(|t| {
            Recommendation::new(
                Category::Configuration,
                Severity::High,
                PRIMARY_KEY_CONFIDENCE,
                format!(
                    "{}.{} holds ~{} rows without a primary key; InnoDB clusters it on a hidden \
                     row id and replicas must scan it to apply row events.",
                    t.schema,
                    t.table,
                    format_number(t.row_estimate.unwrap_or(0))
                ),
                Some(SuggestedAction::Note(format!(
                    "Add a primary key to {}.{}.",
                    t.schema, t.table
                ))),
                Source::Heuristic,
                Target::columns(t.schema.clone(), t.table.clone(), Vec::new()),
            )
        })
        .collect()
}

/// Size alone is not a defect, so these stay advisory.
fn large_tables(snapshot: &MetricSnapshot, config: &AnalyzerConfig) -> Vec<Recommendation> {
    snapshot
        .tables
        .iter()
        .filter(|t| t.data_bytes.max(0) + t.index_bytes.max(0) > config.large_table_bytes)
        .map(|t| {
            let total = t.data_bytes.max(0) + t.index_bytes.max(0);
            Recommendation::new(
                Category::Advisory,
                Severity::Medium,
                LARGE_TABLE_CONFIDENCE,
                format!(
                    "{}.{} occupies {} ({} data, {} indexes).",
                    t.schema,
                    t.table,
                    format_bytes(total),
                    format_bytes(t.data_bytes),
                    format_bytes(t.index_bytes)
                ),
                Some(SuggestedAction::Note(
                    "Consider partitioning or archiving old rows.".into(),
                )),
                Source::Heuristic,
                Target::columns(t.schema.clone(), t.table.clone(), Vec::new()),
            )
        })
        .collect()
}
