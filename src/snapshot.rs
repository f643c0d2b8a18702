use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Restricts a collection to one schema and, optionally, a subset of its tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub tables: Vec<String>,
}

impl Scope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn schema(schema: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            tables: Vec::new(),
        }
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Stable identity used to allow only one in-flight run per scope.
    pub fn key(&self) -> String {
        let mut tables: Vec<String> = self.tables.iter().map(|t| t.to_lowercase()).collect();
        tables.sort();
        tables.dedup();
        format!(
            "{}:{}",
            self.schema.as_deref().unwrap_or("*").to_lowercase(),
            tables.join(",")
        )
    }

    pub fn includes(&self, schema: &str, table: &str) -> bool {
        if let Some(wanted) = &self.schema {
            if !wanted.eq_ignore_ascii_case(schema) {
                return false;
            }
        }
        self.tables.is_empty() || self.tables.iter().any(|t| t.eq_ignore_ascii_case(table))
    }

    /// Schema filter as bound into collector queries ('' = no filter).
    pub(crate) fn schema_filter(&self) -> String {
        self.schema.clone().unwrap_or_default()
    }

    /// Table filter as a comma separated list for `FIND_IN_SET` ('' = no filter).
    pub(crate) fn tables_filter(&self) -> String {
        self.tables.join(",")
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Sections of a snapshot; each is collected independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    ServerStatus,
    Tables,
    Columns,
    Indexes,
    IndexUsage,
    IndexSizes,
    Digests,
    GlobalVariables,
}

impl Section {
    /// Sections without which no analysis is meaningful.
    pub fn is_required(self) -> bool {
        matches!(self, Section::Tables | Section::Indexes)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Section::ServerStatus => "server_status",
            Section::Tables => "tables",
            Section::Columns => "columns",
            Section::Indexes => "indexes",
            Section::IndexUsage => "index_usage",
            Section::IndexSizes => "index_sizes",
            Section::Digests => "digests",
            Section::GlobalVariables => "global_variables",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingSection {
    pub section: Section,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub schema: String,
    pub table: String,
    pub row_estimate: Option<i64>,
    pub data_bytes: i64,
    pub index_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub schema: String,
    pub table: String,
    pub index: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
    pub size_bytes: Option<i64>,
    pub read_count: Option<i64>,
    pub write_count: Option<i64>,
    /// Whether the engine holds a usage row for this index since its last statistics reset.
    pub usage_tracked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub digest: String,
    pub schema: Option<String>,
    pub text: String,
    pub exec_count: i64,
    pub total_latency_ms: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub rows_examined: i64,
    pub rows_returned: i64,
    pub rows_affected: i64,
    pub no_index_used: i64,
}

impl DigestEntry {
    /// Rows examined per row returned; a query returning nothing counts as one row.
    pub fn examined_ratio(&self) -> f64 {
        self.rows_examined.max(0) as f64 / self.rows_returned.max(1) as f64
    }

    /// Fraction of examined rows that were returned (1.0 when nothing was examined).
    pub fn selectivity(&self) -> f64 {
        if self.rows_examined <= 0 {
            1.0
        } else {
            (self.rows_returned.max(0) as f64 / self.rows_examined as f64).min(1.0)
        }
    }

    pub fn rows_examined_per_exec(&self) -> f64 {
        self.rows_examined.max(0) as f64 / self.exec_count.max(1) as f64
    }
}

/// Point-in-time view of the monitored database, immutable once collected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub id: Uuid,
    pub collected_at: DateTime<Utc>,
    pub scope: Scope,
    /// Seconds since statistics were last reset, if known.
    pub observation_window_secs: Option<i64>,
    pub tables: Vec<TableStats>,
    pub columns: Vec<ColumnStats>,
    pub indexes: Vec<IndexStats>,
    pub digests: Vec<DigestEntry>,
    /// Selected global server variables, keyed by lower-case name.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub missing_sections: Vec<MissingSection>,
}

impl MetricSnapshot {
    pub fn empty(scope: Scope) -> Self {
        Self {
            id: Uuid::new_v4(),
            collected_at: Utc::now(),
            scope,
            observation_window_secs: None,
            tables: Vec::new(),
            columns: Vec::new(),
            indexes: Vec::new(),
            digests: Vec::new(),
            variables: BTreeMap::new(),
            missing_sections: Vec::new(),
        }
    }

    /// A numeric server variable, such as a size in bytes.
    pub fn variable_i64(&self, name: &str) -> Option<i64> {
        self.variables
            .get(&name.to_ascii_lowercase())
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn is_complete(&self) -> bool {
        self.missing_sections.is_empty()
    }

    pub fn is_missing(&self, section: Section) -> bool {
        self.missing_sections.iter().any(|m| m.section == section)
    }

    pub fn table(&self, schema: &str, table: &str) -> Option<&TableStats> {
        self.tables
            .iter()
            .find(|t| t.schema.eq_ignore_ascii_case(schema) && t.table.eq_ignore_ascii_case(table))
    }

    /// Schemas that hold a table with this name.
    pub fn schemas_for_table(&self, table: &str) -> Vec<&str> {
        let mut schemas: Vec<&str> = self
            .tables
            .iter()
            .filter(|t| t.table.eq_ignore_ascii_case(table))
            .map(|t| t.schema.as_str())
            .chain(
                self.indexes
                    .iter()
                    .filter(|i| i.table.eq_ignore_ascii_case(table))
                    .map(|i| i.schema.as_str()),
            )
            .collect();
        schemas.sort_unstable();
        schemas.dedup();
        schemas
    }

    pub fn columns_of<'a>(
        &'a self,
        schema: &'a str,
        table: &'a str,
    ) -> impl Iterator<Item = &'a ColumnStats> + 'a {
        self.columns.iter().filter(move |c| {
            c.schema.eq_ignore_ascii_case(schema) && c.table.eq_ignore_ascii_case(table)
        })
    }

    pub fn has_column(&self, schema: &str, table: &str, column: &str) -> bool {
        self.columns_of(schema, table)
            .any(|c| c.column.eq_ignore_ascii_case(column))
    }

    pub fn indexes_of<'a>(
        &'a self,
        schema: &'a str,
        table: &'a str,
    ) -> impl Iterator<Item = &'a IndexStats> + 'a {
        self.indexes.iter().filter(move |i| {
            i.schema.eq_ignore_ascii_case(schema) && i.table.eq_ignore_ascii_case(table)
        })
    }

    pub fn index_descriptors(&self) -> Vec<IndexDescriptor> {
        self.indexes.iter().map(IndexDescriptor::from).collect()
    }
}

/// Comparison unit for unused/redundant detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexDescriptor {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
    pub size_bytes: i64,
    pub usage_count: i64,
}

impl IndexDescriptor {
    pub fn same_table(&self, other: &IndexDescriptor) -> bool {
        self.schema.eq_ignore_ascii_case(&other.schema)
            && self.table.eq_ignore_ascii_case(&other.table)
    }

    /// True when this index's columns are a strict prefix of `other`'s.
    pub fn is_strict_prefix_of(&self, other: &IndexDescriptor) -> bool {
        self.columns.len() < other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    pub fn has_same_columns(&self, other: &IndexDescriptor) -> bool {
        self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl From<&IndexStats> for IndexDescriptor {
    fn from(stats: &IndexStats) -> Self {
        Self {
            schema: stats.schema.clone(),
            table: stats.table.clone(),
            name: stats.index.clone(),
            columns: stats.columns.clone(),
            unique: stats.unique || stats.primary,
            primary: stats.primary,
            size_bytes: stats.size_bytes.unwrap_or(0),
            usage_count: stats.read_count.unwrap_or(0),
        }
    }
}
