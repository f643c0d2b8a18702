use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::analyzer::scoring::{missing_index_confidence, missing_index_severity};
use crate::analyzer::sql::{self, Predicate, StatementKind};
use crate::config::AnalyzerConfig;
use crate::recommendations::{
    Category, Recommendation, Severity, Source, SuggestedAction, Target, format_number,
    qualified_table, quote_ident,
};
use crate::snapshot::{DigestEntry, MetricSnapshot, Section};

const MAX_INDEX_NAME_LEN: usize = 64;

/// Digests that filter one table on one column set.
///
/// Only SELECT digests count as evidence for a new index; writes filtering on
/// the same columns are kept for the rationale.
struct Group<'a> {
    schema: String,
    table: String,
    /// Sorted column set; identifies the recommendation.
    columns: Vec<String>,
    /// Least selective use of each column across the SELECT digests.
    uses: BTreeMap<String, Predicate>,
    selects: Vec<&'a DigestEntry>,
    writes: Vec<&'a DigestEntry>,
    write_kinds: BTreeSet<&'static str>,
}

impl Group<'_> {
    fn contains(&self, digest: &DigestEntry) -> bool {
        self.selects
            .iter()
            .chain(self.writes.iter())
            .any(|d| d.digest == digest.digest)
    }

    /// Columns in index order: equality columns first, then ranges, then the rest.
    fn index_columns(&self) -> Vec<String> {
        let mut ordered = self.columns.clone();
        ordered.sort_by_key(|c| {
            self.uses
                .get(&c.to_lowercase())
                .copied()
                .unwrap_or(Predicate::Other)
        });
        ordered
    }
}

/// Worst-case inefficiency across a set of digests.
fn evidence(digests: &[&DigestEntry]) -> (f64, f64) {
    digests.iter().fold((0.0_f64, 0.0_f64), |(ratio, per_exec), d| {
        (
            ratio.max(d.examined_ratio()),
            per_exec.max(d.rows_examined_per_exec()),
        )
    })
}

fn plural(count: usize) -> &'static str {
    if count == 1 { "" } else { "s" }
}

/// Recommend indexes for inefficient digests whose predicates no index serves.
pub fn detect(snapshot: &MetricSnapshot, config: &AnalyzerConfig) -> Vec<Recommendation> {
    if snapshot.is_missing(Section::Digests) {
        return Vec::new();
    }

    let mut groups: BTreeMap<(String, String, Vec<String>), Group<'_>> = BTreeMap::new();

    for digest in &snapshot.digests {
        let ratio = digest.examined_ratio();
        if ratio < config.examined_ratio_threshold && digest.no_index_used <= 0 {
            continue;
        }

        let parsed = sql::parse(&digest.text);
        let resolved = parsed.resolve(digest.schema.as_deref(), snapshot);
        if resolved.is_empty() {
            debug!(digest = %digest.digest, "inefficient digest without resolvable predicates");
            continue;
        }

        let mut per_table: BTreeMap<(String, String), (String, String, Vec<(String, Predicate)>)> =
            BTreeMap::new();
        for column in resolved {
            if !snapshot.scope.includes(&column.schema, &column.table) {
                continue;
            }
            let entry = per_table
                .entry((column.schema.to_lowercase(), column.table.to_lowercase()))
                .or_insert_with(|| (column.schema.clone(), column.table.clone(), Vec::new()));
            if !entry
                .2
                .iter()
                .any(|(c, _)| c.eq_ignore_ascii_case(&column.column))
            {
                entry.2.push((column.column, column.predicate));
            }
        }

        let is_select = parsed.kind == StatementKind::Select;
        for ((schema_key, table_key), (schema, table, mut used)) in per_table {
            used.sort_by_key(|(c, _)| c.to_lowercase());
            let columns: Vec<String> = used.iter().map(|(c, _)| c.clone()).collect();
            let column_key: Vec<String> = columns.iter().map(|c| c.to_lowercase()).collect();
            let group = groups
                .entry((schema_key, table_key, column_key))
                .or_insert_with(|| Group {
                    schema,
                    table,
                    columns,
                    uses: BTreeMap::new(),
                    selects: Vec::new(),
                    writes: Vec::new(),
                    write_kinds: BTreeSet::new(),
                });
            if group.contains(digest) {
                continue;
            }
            if is_select {
                group.selects.push(digest);
                for (column, predicate) in used {
                    let slot = group
                        .uses
                        .entry(column.to_lowercase())
                        .or_insert(predicate);
                    *slot = (*slot).max(predicate);
                }
            } else {
                group.writes.push(digest);
                group.write_kinds.insert(parsed.kind.as_str());
            }
        }
    }

    groups
        .into_values()
        .filter(|group| !is_covered(snapshot, group))
        .map(|group| build(snapshot, group, config))
        .collect()
}

/// Covered when some index's leading columns are exactly the group's column set.
fn is_covered(snapshot: &MetricSnapshot, group: &Group<'_>) -> bool {
    let wanted: BTreeSet<String> = group.columns.iter().map(|c| c.to_lowercase()).collect();
    snapshot
        .indexes_of(&group.schema, &group.table)
        .any(|index| {
            index.columns.len() >= wanted.len()
                && index.columns[..wanted.len()]
                    .iter()
                    .map(|c| c.to_lowercase())
                    .collect::<BTreeSet<_>>()
                    == wanted
        })
}

fn build(snapshot: &MetricSnapshot, group: Group<'_>, config: &AnalyzerConfig) -> Recommendation {
    let rows = snapshot
        .table(&group.schema, &group.table)
        .and_then(|t| t.row_estimate);
    let supporting = group.selects.len();
    let relation = format!("{}.{}", group.schema, group.table);
    let column_list = group.columns.join(", ");
    let write_kinds = group.write_kinds.iter().copied().collect::<Vec<_>>().join("/");

    let mut blockers = Vec::new();
    if supporting == 0 {
        blockers.push(format!("supporting statements are {write_kinds} only"));
    }
    if let Some(rows) = rows.filter(|r| *r < config.small_table_rows) {
        blockers.push(format!(
            "the table holds only {} rows, so a scan is cheap",
            format_number(rows)
        ));
    }
    if supporting > 0 && supporting < config.min_supporting_digests {
        blockers.push(format!(
            "only {supporting} supporting SELECT digest{}",
            plural(supporting)
        ));
    }

    let (counted, label) = if supporting > 0 {
        (&group.selects, "SELECT".to_string())
    } else {
        (&group.writes, write_kinds.clone())
    };
    let (max_ratio, max_examined_per_exec) = evidence(counted);
    let confidence =
        missing_index_confidence(rows, max_examined_per_exec, counted.len(), config);

    let mut evidence_text = format!(
        "{} {} digest{} filter {} on ({}) without a usable index, examining up to {} rows per row returned",
        counted.len(),
        label,
        plural(counted.len()),
        relation,
        column_list,
        format_number(max_ratio.round() as i64)
    );
    if supporting > 0 && !group.writes.is_empty() {
        evidence_text.push_str(&format!(
            "; {} {} digest{} on the same columns {} not counted as evidence",
            group.writes.len(),
            write_kinds,
            plural(group.writes.len()),
            if group.writes.len() == 1 { "is" } else { "are" }
        ));
    }
    let target = Target::columns(group.schema.clone(), group.table.clone(), group.columns.clone());

    if blockers.is_empty() {
        let rationale = match rows {
            Some(rows) => format!("{evidence_text}; the table holds ~{} rows.", format_number(rows)),
            None => format!("{evidence_text}; the table row count is unknown."),
        };
        Recommendation::new(
            Category::MissingIndex,
            missing_index_severity(rows.unwrap_or(0), max_ratio),
            confidence,
            rationale,
            Some(SuggestedAction::Sql(create_index_ddl(&group))),
            Source::Heuristic,
            target,
        )
        .with_digests(group.selects.iter().map(|d| d.digest.clone()))
    } else {
        let note = format!(
            "Review access to {} ({}) before adding an index: {}.",
            relation,
            column_list,
            blockers.join("; ")
        );
        Recommendation::new(
            Category::Advisory,
            Severity::Low,
            confidence,
            format!("{evidence_text}."),
            Some(SuggestedAction::Note(note)),
            Source::Heuristic,
            target,
        )
        .with_digests(
            group
                .selects
                .iter()
                .chain(group.writes.iter())
                .map(|d| d.digest.clone()),
        )
    }
}

fn create_index_ddl(group: &Group<'_>) -> String {
    let ordered = group.index_columns();
    let columns: Vec<String> = ordered.iter().map(|c| quote_ident(c)).collect();
    format!(
        "CREATE INDEX {} ON {} ({});",
        quote_ident(&index_name(&group.table, &ordered)),
        qualified_table(&group.schema, &group.table),
        columns.join(", ")
    )
}


fn index_name(table: &str, columns: &[String]) -> String {
    let raw = format!("idx_{}_{}", table, columns.join("_"));
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c.to_ascii_lowercase() } else { '_' })
        .collect();
    name.truncate(MAX_INDEX_NAME_LEN);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ColumnStats, IndexStats, Scope, TableStats};

    fn snapshot(rows: i64) -> MetricSnapshot {
        let mut snapshot = MetricSnapshot::empty(Scope::schema("shop"));
        snapshot.tables.push(TableStats {
            schema: "shop".into(),
            table: "orders".into(),
            row_estimate: Some(rows),
            data_bytes: 0,
            index_bytes: 0,
        });
        for column in ["id", "user_id", "status", "created_at"] {
            snapshot.columns.push(ColumnStats {
                schema: "shop".into(),
                table: "orders".into(),
                column: column.into(),
                data_type: "bigint".into(),
                nullable: false,
            });
        }
        snapshot.indexes.push(IndexStats {
            schema: "shop".into(),
            table: "orders".into(),
            index: "PRIMARY".into(),
            columns: vec!["id".into()],
            unique: true,
            primary: true,
            size_bytes: None,
            read_count: None,
            write_count: None,
            usage_tracked: false,
        });
        snapshot
    }

    fn digest(id: &str, text: &str, examined: i64, returned: i64) -> DigestEntry {
        DigestEntry {
            digest: id.into(),
            schema: Some("shop".into()),
            text: text.into(),
            exec_count: 100,
            total_latency_ms: 1_000.0,
            avg_latency_ms: 10.0,
            min_latency_ms: 1.0,
            max_latency_ms: 50.0,
            rows_examined: examined,
            rows_returned: returned,
            rows_affected: 0,
            no_index_used: 0,
        }
    }

    #[test]
    fn corroborated_select_becomes_missing_index() {
        let mut snap = snapshot(1_000_000);
        for i in 0..5 {
            snap.digests.push(digest(
                &format!("d{i}"),
                &format!("SELECT * FROM `orders` WHERE `user_id` = ? LIMIT {i}"),
                10_000_000,
                1_000,
            ));
        }
        let recs = detect(&snap, &AnalyzerConfig::default());
        assert_eq!(recs.len(), 1);
        let rec = &recs[0];
        assert_eq!(rec.category, Category::MissingIndex);
        assert_eq!(rec.severity, Severity::High);
        assert_eq!(rec.supporting_digests, 5);
        assert_eq!(
            rec.suggested_action,
            Some(SuggestedAction::Sql(
                "CREATE INDEX `idx_orders_user_id` ON `shop`.`orders` (`user_id`);".into()
            ))
        );
    }

    #[test]
    fn efficient_digests_are_ignored() {
        let mut snap = snapshot(1_000_000);
        snap.digests
            .push(digest("d1", "SELECT * FROM orders WHERE user_id = ?", 100, 100));
        assert!(detect(&snap, &AnalyzerConfig::default()).is_empty());
    }

    #[test]
    fn covered_column_sets_are_skipped() {
        let mut snap = snapshot(1_000_000);
        snap.indexes.push(IndexStats {
            schema: "shop".into(),
            table: "orders".into(),
            index: "idx_user_created".into(),
            columns: vec!["user_id".into(), "created_at".into()],
            unique: false,
            primary: false,
            size_bytes: None,
            read_count: None,
            write_count: None,
            usage_tracked: false,
        });
        snap.digests.push(digest("d1", "SELECT * FROM orders WHERE user_id = ?", 1_000_000, 10));
        snap.digests.push(digest("d2", "SELECT id FROM orders WHERE user_id = ?", 1_000_000, 10));
        assert!(detect(&snap, &AnalyzerConfig::default()).is_empty());
    }

    #[test]
    fn single_digest_is_advisory_without_ddl() {
        let mut snap = snapshot(1_000_000);
        snap.digests.push(digest("d1", "SELECT * FROM orders WHERE status = ?", 1_000_000, 10));
        let recs = detect(&snap, &AnalyzerConfig::default());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].category, Category::Advisory);
        assert!(matches!(recs[0].suggested_action, Some(SuggestedAction::Note(_))));
    }

    #[test]
    fn tiny_table_is_advisory() {
        let mut snap = snapshot(15);
        for i in 0..5 {
            snap.digests.push(digest(
                &format!("d{i}"),
                &format!("SELECT * FROM orders WHERE status = ? LIMIT {i}"),
                15_000,
                1,
            ));
        }
        let recs = detect(&snap, &AnalyzerConfig::default());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].category, Category::Advisory);
        let note = recs[0].suggested_action.as_ref().map(|a| a.text().to_string());
        assert!(note.unwrap_or_default().contains("15 rows"));
    }

    #[test]
    fn no_index_used_flag_counts_as_evidence() {
        let mut snap = snapshot(1_000_000);
        let mut flagged = digest("d1", "SELECT * FROM orders WHERE status = ?", 10, 10);
        flagged.no_index_used = 100;
        snap.digests.push(flagged);
        assert_eq!(detect(&snap, &AnalyzerConfig::default()).len(), 1);
    }

    #[test]
    fn index_names_are_sanitised_and_bounded() {
        let columns: Vec<String> = (0..20).map(|i| format!("Column-{i}")).collect();
        let name = index_name("Orders", &columns);
        assert!(name.len() <= MAX_INDEX_NAME_LEN);
        assert!(name.starts_with("idx_orders_column_0"));
    }
    #[test]
    fn write_digests_do_not_veto_select_evidence() {
        let mut snap = snapshot(1_000_000);
        for i in 0..5 {
            snap.digests.push(digest(
                &format!("s{i}"),
                &format!("SELECT * FROM `orders` WHERE `user_id` = ? LIMIT {i}"),
                10_000_000,
                1_000,
            ));
        }
        snap.digests.push(digest(
            "u1",
            "UPDATE `orders` SET `status` = ? WHERE `user_id` = ?",
            10_000_000,
            1,
        ));
        let recs = detect(&snap, &AnalyzerConfig::default());
        assert_eq!(recs.len(), 1);
        let rec = &recs[0];
        assert_eq!(rec.category, Category::MissingIndex);
        assert_eq!(rec.supporting_digests, 5);
        assert!(!rec.digests.contains(&"u1".to_string()));
        assert!(rec.rationale.contains("1 UPDATE digest"), "{}", rec.rationale);
    }

    #[test]
    fn write_only_evidence_stays_advisory() {
        let mut snap = snapshot(1_000_000);
        for i in 0..3 {
            snap.digests.push(digest(
                &format!("u{i}"),
                &format!("DELETE FROM `orders` WHERE `status` = ? LIMIT {i}"),
                1_000_000,
                1,
            ));
        }
        let recs = detect(&snap, &AnalyzerConfig::default());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].category, Category::Advisory);
        assert_eq!(recs[0].supporting_digests, 3);
        let note = recs[0].suggested_action.as_ref().map(|a| a.text().to_string());
        assert!(note.unwrap_or_default().contains("DELETE only"));
    }

    #[test]
    fn equality_columns_lead_the_index() {
        let mut snap = snapshot(1_000_000);
        for i in 0..3 {
            snap.digests.push(digest(
                &format!("d{i}"),
                &format!(
                    "SELECT * FROM `orders` WHERE `created_at` > ? AND `user_id` = ? LIMIT {i}"
                ),
                10_000_000,
                1_000,
            ));
        }
        let recs = detect(&snap, &AnalyzerConfig::default());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].target.columns, vec!["created_at", "user_id"]);
        assert_eq!(
            recs[0].suggested_action,
            Some(SuggestedAction::Sql(
                "CREATE INDEX `idx_orders_user_id_created_at` ON `shop`.`orders` (`user_id`, `created_at`);"
                    .into()
            ))
        );
    }
}
