use tracing::debug;

use crate::analyzer::scoring::{severity_for_size, unused_confidence};
use crate::config::AnalyzerConfig;
use crate::recommendations::{
    Category, Recommendation, Source, SuggestedAction, Target, format_bytes, format_number,
    qualified_table, quote_ident,
};
use crate::snapshot::{MetricSnapshot, Section};

/// Recommend dropping secondary indexes that were never read during the window.
pub fn detect(snapshot: &MetricSnapshot, config: &AnalyzerConfig) -> Vec<Recommendation> {
    if snapshot.is_missing(Section::IndexUsage) || snapshot.is_missing(Section::Indexes) {
        debug!("index usage unavailable; skipping unused index detection");
        return Vec::new();
    }

    let confidence = unused_confidence(snapshot.observation_window_secs, config);
    let mut recommendations = Vec::new();

    for index in &snapshot.indexes {
        if index.primary || index.unique {
            continue;
        }

        // Untracked indexes have no usage row, which is the same as zero reads.
        let reads = if index.usage_tracked {
            index.read_count.unwrap_or(0)
        } else {
            0
        };
        if reads > config.unused_max_reads {
            continue;
        }

        let size = match index.size_bytes {
            Some(size) if size >= config.min_index_size_bytes => size,
            _ => continue,
        };

        let mut rationale = format!(
            "Index {} on {}.{} ({}) occupies {} and recorded {} reads",
            index.index,
            index.schema,
            index.table,
            index.columns.join(", "),
            format_bytes(size),
            format_number(reads)
        );
        match snapshot.observation_window_secs {
            Some(secs) => rationale.push_str(&format!(
                " over {} hours of collected statistics",
                format_number(secs / 3600)
            )),
            None => rationale.push_str(" (statistics window unknown)"),
        }
        if let Some(writes) = index.write_count.filter(|w| *w > 0) {
            rationale.push_str(&format!(
                ", while paying for {} index writes",
                format_number(writes)
            ));
        }
        rationale.push_str(". Dropping it saves space and write amplification.");

        recommendations.push(Recommendation::new(
            Category::UnusedIndex,
            severity_for_size(size, &config.size_tiers),
            confidence,
            rationale,
            Some(SuggestedAction::Sql(format!(
                "DROP INDEX {} ON {};",
                quote_ident(&index.index),
                qualified_table(&index.schema, &index.table)
            ))),
            Source::Heuristic,
            Target::index(
                index.schema.clone(),
                index.table.clone(),
                index.index.clone(),
                index.columns.clone(),
            ),
        ));
    }

    recommendations
}
