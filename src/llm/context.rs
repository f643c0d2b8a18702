use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::analyzer::sql;
use crate::snapshot::{DigestEntry, MetricSnapshot, Scope};

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'(?:[^'\\]|\\.|'')*'|"(?:[^"\\]|\\.|"")*""#).expect("valid regex"));
static HEX_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b0x[0-9a-f]+\b|\bx'[0-9a-f]*'").expect("valid regex"));
static NUMERIC_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?(?:e[+-]?\d+)?\b").expect("valid regex"));

/// What the provider is allowed to see: aggregate metrics, literal-free
/// statement text and the structure of the tables those statements touch.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisContext {
    pub scope: Scope,
    pub tables: Vec<TableSummary>,
    pub digests: Vec<DigestSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub schema: String,
    pub table: String,
    pub row_estimate: Option<i64>,
    pub columns: Vec<ColumnSummary>,
    pub indexes: Vec<IndexSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnSummary {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub reads: Option<i64>,
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DigestSummary {
    pub digest: String,
    pub schema: Option<String>,
    pub text: String,
    pub exec_count: i64,
    pub total_latency_ms: f64,
    pub avg_latency_ms: f64,
    pub rows_examined: i64,
    pub rows_returned: i64,
    pub examined_ratio: f64,
    pub no_index_used: i64,
}

impl AnalysisContext {
    /// Top `max_digests` digests by total latency plus the tables they reference.
    pub fn from_snapshot(snapshot: &MetricSnapshot, max_digests: usize) -> Self {
        let mut ranked: Vec<&DigestEntry> = snapshot.digests.iter().collect();
        ranked.sort_by(|a, b| {
            b.total_latency_ms
                .total_cmp(&a.total_latency_ms)
                .then_with(|| a.digest.cmp(&b.digest))
        });
        ranked.truncate(max_digests);

        let mut referenced: BTreeSet<(String, String)> = BTreeSet::new();
        for entry in &ranked {
            for table_ref in sql::parse(&entry.text).tables {
                let candidates: Vec<&str> = match table_ref.schema.as_deref().or(entry.schema.as_deref()) {
                    Some(schema) => vec![schema],
                    None => snapshot.schemas_for_table(&table_ref.table),
                };
                for schema in candidates {
                    if let Some(stats) = snapshot.table(schema, &table_ref.table) {
                        referenced.insert((stats.schema.clone(), stats.table.clone()));
                    }
                }
            }
        }

        let tables = referenced
            .into_iter()
            .map(|(schema, table)| summarize_table(snapshot, schema, table))
            .collect();
        let digests = ranked.into_iter().map(summarize_digest).collect();

        Self {
            scope: snapshot.scope.clone(),
            tables,
            digests,
        }
    }

    /// Find a table by name, using the schema when given. Without a schema
    /// the name must be unambiguous.
    pub fn find_table(&self, schema: Option<&str>, table: &str) -> Option<&TableSummary> {
        let mut matches = self.tables.iter().filter(|t| {
            t.table.eq_ignore_ascii_case(table)
                && schema.is_none_or(|s| t.schema.eq_ignore_ascii_case(s))
        });
        let first = matches.next()?;
        match matches.next() {
            Some(_) => None,
            None => Some(first),
        }
    }

    pub fn has_digest(&self, digest: &str) -> bool {
        self.digests.iter().any(|d| d.digest == digest)
    }
}

impl TableSummary {
    pub fn column(&self, name: &str) -> Option<&ColumnSummary> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn index(&self, name: &str) -> Option<&IndexSummary> {
        self.indexes.iter().find(|i| i.name.eq_ignore_ascii_case(name))
    }
}

fn summarize_table(snapshot: &MetricSnapshot, schema: String, table: String) -> TableSummary {
    let row_estimate = snapshot.table(&schema, &table).and_then(|t| t.row_estimate);
    let columns = snapshot
        .columns_of(&schema, &table)
        .map(|c| ColumnSummary {
            name: c.column.clone(),
            data_type: c.data_type.clone(),
            nullable: c.nullable,
        })
        .collect();
    let indexes = snapshot
        .indexes_of(&schema, &table)
        .map(|i| IndexSummary {
            name: i.index.clone(),
            columns: i.columns.clone(),
            unique: i.unique,
            reads: i.read_count,
            size_bytes: i.size_bytes,
        })
        .collect();
    TableSummary {
        schema,
        table,
        row_estimate,
        columns,
        indexes,
    }
}

fn summarize_digest(entry: &DigestEntry) -> DigestSummary {
    DigestSummary {
        digest: entry.digest.clone(),
        schema: entry.schema.clone(),
        text: anonymize(&entry.text),
        exec_count: entry.exec_count,
        total_latency_ms: entry.total_latency_ms,
        avg_latency_ms: entry.avg_latency_ms,
        rows_examined: entry.rows_examined,
        rows_returned: entry.rows_returned,
        examined_ratio: entry.examined_ratio(),
        no_index_used: entry.no_index_used,
    }
}

/// Replace string, hex and numeric literals with `?`.
pub(crate) fn anonymize(text: &str) -> String {
    let text = HEX_LITERAL.replace_all(text, "?");
    let text = STRING_LITERAL.replace_all(&text, "?");
    NUMERIC_LITERAL.replace_all(&text, "?").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ColumnStats, IndexStats, TableStats};

    fn digest(id: &str, text: &str, latency: f64) -> DigestEntry {
        DigestEntry {
            digest: id.into(),
            schema: Some("shop".into()),
            text: text.into(),
            exec_count: 10,
            total_latency_ms: latency,
            avg_latency_ms: latency / 10.0,
            min_latency_ms: 0.0,
            max_latency_ms: latency,
            rows_examined: 1000,
            rows_returned: 10,
            rows_affected: 0,
            no_index_used: 10,
        }
    }

    fn table(name: &str) -> TableStats {
        TableStats {
            schema: "shop".into(),
            table: name.into(),
            row_estimate: Some(100),
            data_bytes: 0,
            index_bytes: 0,
        }
    }

    fn snapshot() -> MetricSnapshot {
        let mut snapshot = MetricSnapshot::empty(Scope::schema("shop"));
        snapshot.tables = vec![table("orders"), table("users"), table("audit")];
        snapshot.columns = vec![ColumnStats {
            schema: "shop".into(),
            table: "orders".into(),
            column: "user_id".into(),
            data_type: "bigint".into(),
            nullable: false,
        }];
        snapshot.indexes = vec![IndexStats {
            schema: "shop".into(),
            table: "orders".into(),
            index: "PRIMARY".into(),
            columns: vec!["id".into()],
            unique: true,
            primary: true,
            size_bytes: Some(16384),
            read_count: Some(5),
            write_count: Some(1),
            usage_tracked: true,
        }];
        snapshot.digests = vec![
            digest("a", "SELECT * FROM `orders` WHERE `user_id` = 42", 50.0),
            digest("b", "SELECT * FROM `users` WHERE `email` = 'x@y.z'", 500.0),
            digest("c", "SELECT * FROM `audit` WHERE `id` = 1", 5.0),
        ];
        snapshot
    }

    #[test]
    fn keeps_top_digests_and_their_tables_only() {
        let context = AnalysisContext::from_snapshot(&snapshot(), 2);
        let ids: Vec<&str> = context.digests.iter().map(|d| d.digest.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        let tables: Vec<&str> = context.tables.iter().map(|t| t.table.as_str()).collect();
        assert_eq!(tables, vec!["orders", "users"]);

        let orders = context.find_table(None, "ORDERS").unwrap();
        assert!(orders.column("user_id").is_some());
        assert!(orders.index("primary").is_some());
    }

    #[test]
    fn digest_text_carries_no_literals() {
        let context = AnalysisContext::from_snapshot(&snapshot(), 5);
        for summary in &context.digests {
            assert!(!summary.text.contains("42"));
            assert!(!summary.text.contains("x@y.z"));
        }
    }

    #[test]
    fn anonymize_replaces_literals_but_not_identifiers() {
        assert_eq!(
            anonymize("SELECT * FROM t1 WHERE a = 'it''s' AND b IN (1, 2.5) AND c = 0xFF"),
            "SELECT * FROM t1 WHERE a = ? AND b IN (?, ?) AND c = ?"
        );
        assert_eq!(anonymize(r#"WHERE name = "bob""#), "WHERE name = ?");
    }
}
