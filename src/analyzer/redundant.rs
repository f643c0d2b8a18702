use std::collections::BTreeMap;

use crate::config::AnalyzerConfig;
use crate::recommendations::{
    Category, Recommendation, Severity, Source, SuggestedAction, Target, format_bytes,
    qualified_table, quote_ident,
};
use crate::snapshot::{IndexDescriptor, MetricSnapshot, Section};

/// Recommend dropping indexes whose columns are already served by another index.
pub fn detect(snapshot: &MetricSnapshot, config: &AnalyzerConfig) -> Vec<Recommendation> {
    if snapshot.is_missing(Section::Indexes) {
        return Vec::new();
    }

    let mut by_table: BTreeMap<(String, String), Vec<IndexDescriptor>> = BTreeMap::new();
    for descriptor in snapshot.index_descriptors() {
        by_table
            .entry((
                descriptor.schema.to_lowercase(),
                descriptor.table.to_lowercase(),
            ))
            .or_default()
            .push(descriptor);
    }

    let mut recommendations = Vec::new();
    for indexes in by_table.values() {
        for candidate in indexes {
            if candidate.unique || candidate.primary || candidate.columns.is_empty() {
                continue;
            }
            if let Some((covering, reason)) = find_covering(candidate, indexes) {
                recommendations.push(build(candidate, covering, reason, config));
            }
        }
    }

    recommendations
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reason {
    Prefix,
    Duplicate,
}

/// The index that makes `candidate` redundant, if any.
///
/// A strict prefix is reported against the longest covering index (ties by
/// name). Otherwise an exact twin counts when it is unique, or when both are
/// non-unique and the candidate has the greater name.
fn find_covering<'a>(
    candidate: &IndexDescriptor,
    indexes: &'a [IndexDescriptor],
) -> Option<(&'a IndexDescriptor, Reason)> {
    let longest = indexes
        .iter()
        .filter(|other| candidate.is_strict_prefix_of(other))
        .max_by(|a, b| {
            a.columns
                .len()
                .cmp(&b.columns.len())
                .then_with(|| b.name.to_lowercase().cmp(&a.name.to_lowercase()))
        });
    if let Some(covering) = longest {
        return Some((covering, Reason::Prefix));
    }

    let candidate_name = candidate.name.to_lowercase();
    let twins: Vec<&IndexDescriptor> = indexes
        .iter()
        .filter(|other| {
            !other.name.eq_ignore_ascii_case(&candidate.name) && candidate.has_same_columns(other)
        })
        .collect();

    twins
        .iter()
        .copied()
        .filter(|twin| twin.unique)
        .min_by_key(|twin| (!twin.primary, twin.name.to_lowercase()))
        .or_else(|| {
            twins
                .iter()
                .copied()
                .filter(|twin| !twin.unique && twin.name.to_lowercase() < candidate_name)
                .min_by_key(|twin| twin.name.to_lowercase())
        })
        .map(|twin| (twin, Reason::Duplicate))
}

fn build(
    redundant: &IndexDescriptor,
    covering: &IndexDescriptor,
    reason: Reason,
    config: &AnalyzerConfig,
) -> Recommendation {
    let severity = if redundant.size_bytes >= config.size_tiers.high_bytes {
        Severity::High
    } else {
        Severity::Medium
    };

    let relation = format!("{}.{}", redundant.schema, redundant.table);
    let mut rationale = match reason {
        Reason::Prefix => format!(
            "Index {} ({}) on {} is a leading prefix of {} ({}); every lookup it serves can use {} instead",
            redundant.name,
            redundant.columns.join(", "),
            relation,
            covering.name,
            covering.columns.join(", "),
            covering.name
        ),
        Reason::Duplicate => format!(
            "Index {} on {} duplicates {} ({}){}",
            redundant.name,
            relation,
            covering.name,
            covering.columns.join(", "),
            if covering.unique {
                ", which also enforces uniqueness"
            } else {
                ""
            }
        ),
    };
    if redundant.size_bytes > 0 {
        rationale.push_str(&format!(
            ". Dropping it frees {}.",
            format_bytes(redundant.size_bytes)
        ));
    } else {
        rationale.push('.');
    }

    Recommendation::new(
        Category::RedundantIndex,
        severity,
        config.redundant_confidence,
        rationale,
        Some(SuggestedAction::Sql(format!(
            "DROP INDEX {} ON {};",
            quote_ident(&redundant.name),
            qualified_table(&redundant.schema, &redundant.table)
        ))),
        Source::Heuristic,
        Target::index(
            redundant.schema.clone(),
            redundant.table.clone(),
            redundant.name.clone(),
            redundant.columns.clone(),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{IndexStats, Scope};

    fn index(name: &str, columns: &[&str], unique: bool) -> IndexStats {
        IndexStats {
            schema: "shop".into(),
            table: "orders".into(),
            index: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique,
            primary: name == "PRIMARY",
            size_bytes: Some(4 * 1024 * 1024),
            read_count: Some(100),
            write_count: Some(100),
            usage_tracked: true,
        }
    }

    fn run(indexes: Vec<IndexStats>) -> Vec<Recommendation> {
        let mut snapshot = MetricSnapshot::empty(Scope::schema("shop"));
        snapshot.indexes = indexes;
        detect(&snapshot, &AnalyzerConfig::default())
    }

    fn flagged(recs: &[Recommendation]) -> Vec<String> {
        recs.iter()
            .filter_map(|r| r.target.index.clone())
            .collect()
    }

    #[test]
    fn prefix_index_is_flagged_not_the_wider_one() {
        let recs = run(vec![
            index("idx_a", &["col1"], false),
            index("idx_b", &["col1", "col2"], false),
        ]);
        assert_eq!(flagged(&recs), vec!["idx_a"]);
        assert_eq!(recs[0].severity, Severity::Medium);
        assert!((recs[0].confidence - 0.95).abs() < 1e-9);
        assert!(recs[0].rationale.contains("idx_b"));
    }

    #[test]
    fn unique_prefix_is_never_flagged() {
        let recs = run(vec![
            index("uq_a", &["col1"], true),
            index("idx_b", &["col1", "col2"], false),
        ]);
        assert!(recs.is_empty());
    }

    #[test]
    fn reported_once_against_longest_cover() {
        let recs = run(vec![
            index("idx_a", &["col1"], false),
            index("idx_b", &["col1", "col2"], false),
            index("idx_c", &["col1", "col2", "col3"], false),
        ]);
        assert_eq!(flagged(&recs), vec!["idx_a", "idx_b"]);
        assert!(recs[0].rationale.contains("idx_c"));
    }

    #[test]
    fn exact_duplicates_flag_exactly_one() {
        let recs = run(vec![
            index("idx_x", &["col1", "col2"], false),
            index("idx_y", &["col1", "col2"], false),
        ]);
        assert_eq!(flagged(&recs), vec!["idx_y"]);

        let recs = run(vec![
            index("a_plain", &["col1"], false),
            index("z_unique", &["col1"], true),
        ]);
        assert_eq!(flagged(&recs), vec!["a_plain"]);
    }

    #[test]
    fn non_unique_twin_of_primary_key_is_flagged() {
        let recs = run(vec![
            index("PRIMARY", &["id"], true),
            index("idx_id", &["id"], false),
        ]);
        assert_eq!(flagged(&recs), vec!["idx_id"]);
    }

    #[test]
    fn different_tables_never_compared() {
        let mut other = index("idx_b", &["col1", "col2"], false);
        other.table = "customers".into();
        let recs = run(vec![index("idx_a", &["col1"], false), other]);
        assert!(recs.is_empty());
    }
}
