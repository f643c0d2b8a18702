//! Reading of normalized digest text and suggested SQL.
//!
//! Digest text is parsed with `sqlparser` under the MySQL dialect once digest
//! placeholders such as `(...)` are rewritten to `(?)`. Truncated or otherwise
//! unparseable text goes through a small pattern-based reader instead, so a
//! digest never fails outright; it may only yield fewer references.

mod fallback;
mod walk;

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use sqlparser::ast::Statement;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::snapshot::MetricSnapshot;

static ELIDED_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\s*\.\.\.\s*\)").expect("valid regex"));

static NAME_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"`((?:[^`]|``)*)`|"([^"]*)"|([^.\s`"]+)"#).expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Other,
}

impl StatementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Replace => "REPLACE",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Other => "OTHER",
        }
    }
}

/// How a column takes part in a statement.
///
/// Ordered from most to least useful as a leading index column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Predicate {
    /// `=`, `<=>`, `IN` and `IS NULL`.
    Equality,
    /// Comparisons, `BETWEEN` and `LIKE`.
    Range,
    /// Written columns and other non-sargable uses.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub table: String,
    pub alias: Option<String>,
}

impl TableRef {
    /// Name that qualifies this table's columns inside the statement.
    pub fn qualifier(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    pub fn is(&self, schema: &str, table: &str) -> bool {
        self.table.eq_ignore_ascii_case(table)
            && self
                .schema
                .as_deref()
                .is_none_or(|s| s.eq_ignore_ascii_case(schema))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub column: String,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatement {
    pub kind: StatementKind,
    pub tables: Vec<TableRef>,
    pub columns: Vec<ColumnRef>,
}

/// A column resolved to a concrete table of the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedColumn {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub predicate: Predicate,
}

/// Shape of a single suggested statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStatement {
    /// `CREATE INDEX ... ON t (...)` or `ALTER TABLE t ADD INDEX ... (...)`.
    CreateIndex { table: TableRef, columns: Vec<String> },
    /// `DROP INDEX i ON t` or `ALTER TABLE t DROP INDEX i`.
    DropIndex { table: Option<TableRef>, index: String },
    Select { tables: Vec<TableRef> },
    Other,
}

/// Rewrites digest placeholders so the text parses as MySQL.
fn prepare(text: &str) -> String {
    ELIDED_LIST.replace_all(text.trim(), "(?)").into_owned()
}

fn parse_single(text: &str) -> Option<Statement> {
    let mut statements = Parser::parse_sql(&MySqlDialect {}, &prepare(text)).ok()?;
    if statements.len() == 1 {
        statements.pop()
    } else {
        None
    }
}

/// Reads a digest text into statement kind, table references and predicate columns.
pub fn parse(text: &str) -> ParsedStatement {
    match parse_single(text) {
        Some(statement) => walk::statement(&statement),
        None => fallback::parse(text),
    }
}

/// Reads one suggested statement. `None` when the text is not exactly one
/// parseable MySQL statement.
pub fn read_action(text: &str) -> Option<ActionStatement> {
    let statement = parse_single(text)?;
    Some(walk::action(&statement))
}

/// Splits `schema.table` (quoted or not) into its parts.
pub(crate) fn split_name(text: &str) -> (Option<String>, String) {
    let mut parts: Vec<String> = NAME_PART
        .captures_iter(text)
        .filter_map(|c| {
            c.get(1)
                .map(|m| m.as_str().replace("``", "`"))
                .or_else(|| c.get(2).or(c.get(3)).map(|m| m.as_str().to_string()))
        })
        .collect();
    let table = parts.pop().unwrap_or_default();
    (parts.pop(), table)
}

/// Strips identifier quoting from a single name.
pub(crate) fn unquote(text: &str) -> String {
    split_name(text).1
}

impl ParsedStatement {
    /// Maps every column reference onto a table known to the snapshot.
    ///
    /// Qualified columns go through the alias map; bare columns go to the only
    /// referenced table, or to the single referenced table whose column stats
    /// contain them. Columns that cannot be placed are dropped. A column seen
    /// more than once keeps its most selective use.
    pub fn resolve(
        &self,
        default_schema: Option<&str>,
        snapshot: &MetricSnapshot,
    ) -> Vec<ResolvedColumn> {
        let mut bound: Vec<(String, String)> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();

        for table in &self.tables {
            let Some(schema) = resolve_schema(table, default_schema, snapshot) else {
                continue;
            };
            let index = match bound.iter().position(|(s, t)| {
                s.eq_ignore_ascii_case(&schema) && t.eq_ignore_ascii_case(&table.table)
            }) {
                Some(existing) => existing,
                None => {
                    bound.push((schema, table.table.clone()));
                    bound.len() - 1
                }
            };
            by_name.insert(table.table.to_lowercase(), index);
            if let Some(alias) = &table.alias {
                by_name.insert(alias.to_lowercase(), index);
            }
        }

        let mut resolved: Vec<ResolvedColumn> = Vec::new();
        for column in &self.columns {
            let target = match &column.qualifier {
                Some(qualifier) => by_name.get(&qualifier.to_lowercase()).copied(),
                None if bound.len() == 1 => Some(0),
                None => {
                    let owners: Vec<usize> = bound
                        .iter()
                        .enumerate()
                        .filter(|(_, (schema, table))| {
                            snapshot.has_column(schema, table, &column.column)
                        })
                        .map(|(idx, _)| idx)
                        .collect();
                    if owners.len() == 1 { Some(owners[0]) } else { None }
                }
            };
            let Some(index) = target else {
                continue;
            };
            let (schema, table) = &bound[index];
            let known_columns = snapshot.columns_of(schema, table).count();
            if known_columns > 0 && !snapshot.has_column(schema, table, &column.column) {
                continue;
            }
            let canonical = snapshot
                .columns_of(schema, table)
                .find(|c| c.column.eq_ignore_ascii_case(&column.column))
                .map(|c| c.column.clone())
                .unwrap_or_else(|| column.column.clone());
            let table = canonical_table(snapshot, schema, table);

            match resolved.iter_mut().find(|r| {
                r.schema == *schema && r.table == table && r.column.eq_ignore_ascii_case(&canonical)
            }) {
                Some(existing) => existing.predicate = existing.predicate.min(column.predicate),
                None => resolved.push(ResolvedColumn {
                    schema: schema.clone(),
                    table,
                    column: canonical,
                    predicate: column.predicate,
                }),
            }
        }
        resolved
    }
}

fn resolve_schema(
    table: &TableRef,
    default_schema: Option<&str>,
    snapshot: &MetricSnapshot,
) -> Option<String> {
    if let Some(schema) = &table.schema {
        return Some(schema.clone());
    }
    let candidates = snapshot.schemas_for_table(&table.table);
    if let Some(default) = default_schema {
        if candidates.is_empty() || candidates.iter().any(|s| s.eq_ignore_ascii_case(default)) {
            return Some(default.to_string());
        }
    }
    match candidates.as_slice() {
        [only] => Some((*only).to_string()),
        _ => None,
    }
}

fn canonical_table(snapshot: &MetricSnapshot, schema: &str, table: &str) -> String {
    snapshot
        .table(schema, table)
        .map(|t| t.table.clone())
        .unwrap_or_else(|| table.to_string())
}
