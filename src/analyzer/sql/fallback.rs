//! Pattern reader for digest text the parser rejects, most often text that
//! performance_schema truncated mid-statement.

use std::sync::LazyLock;

use regex::Regex;

use super::{ColumnRef, ParsedStatement, Predicate, StatementKind, TableRef, split_name, unquote};

const NAME: &str = r"(?:`(?:[^`]|``)+`|[A-Za-z_][A-Za-z0-9_$]*)";

static TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:FROM|JOIN|INTO|UPDATE)\s+({NAME}(?:\s*\.\s*{NAME})?)(?:\s+(?:AS\s+)?({NAME}))?"
    ))
    .expect("valid regex")
});

static COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:WHERE|AND|OR|ON)\s+(?:({NAME})\s*\.\s*)?({NAME})\s*(<=>|<=|>=|<>|!=|=|<|>|\bNOT\s+IN\b|\bIN\b|\bBETWEEN\b|\bLIKE\b|\bIS\s+NOT\b|\bIS\b)"
    ))
    .expect("valid regex")
});

/// Words that can follow a table name without being its alias.
const NOT_ALIAS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "CROSS", "STRAIGHT_JOIN", "NATURAL", "ON", "USING",
    "SET", "VALUES", "VALUE", "SELECT", "GROUP", "ORDER", "LIMIT", "HAVING", "UNION", "FOR",
    "LOCK", "FORCE", "IGNORE", "USE", "PARTITION", "WINDOW",
];

pub(super) fn parse(text: &str) -> ParsedStatement {
    ParsedStatement {
        kind: kind(text),
        tables: tables(text),
        columns: columns(text),
    }
}

fn kind(text: &str) -> StatementKind {
    let first = text
        .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match first.as_str() {
        "SELECT" | "WITH" => StatementKind::Select,
        "INSERT" => StatementKind::Insert,
        "REPLACE" => StatementKind::Replace,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        _ => StatementKind::Other,
    }
}

fn tables(text: &str) -> Vec<TableRef> {
    let mut found: Vec<TableRef> = Vec::new();
    for caps in TABLE.captures_iter(text) {
        let (schema, table) = split_name(&caps[1]);
        if table.is_empty() {
            continue;
        }
        let alias = caps
            .get(2)
            .map(|m| m.as_str())
            .filter(|word| !NOT_ALIAS.iter().any(|k| k.eq_ignore_ascii_case(word)))
            .map(unquote);
        let table = TableRef {
            schema,
            table,
            alias,
        };
        if !found.contains(&table) {
            found.push(table);
        }
    }
    found
}

fn columns(text: &str) -> Vec<ColumnRef> {
    COLUMN
        .captures_iter(text)
        .map(|caps| {
            let op = caps[3].to_ascii_uppercase();
            let op: String = op.split_whitespace().collect::<Vec<_>>().join(" ");
            let predicate = match op.as_str() {
                "=" | "<=>" | "IN" | "IS" => Predicate::Equality,
                "<" | "<=" | ">" | ">=" | "BETWEEN" | "LIKE" | "IS NOT" => Predicate::Range,
                _ => Predicate::Other,
            };
            ColumnRef {
                qualifier: caps.get(1).map(|m| unquote(m.as_str())),
                column: unquote(&caps[2]),
                predicate,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_after_a_table_are_not_aliases() {
        let parsed = parse("SELECT * FROM orders WHERE user_id = ? AND ...");
        assert_eq!(parsed.tables.len(), 1);
        assert_eq!(parsed.tables[0].alias, None);
    }

    #[test]
    fn reads_update_target_and_filters() {
        let parsed = parse("UPDATE `accounts` SET `balance` = ? WHERE `owner_id` >= ? AND `bal...");
        assert_eq!(parsed.kind, StatementKind::Update);
        assert_eq!(parsed.tables[0].table, "accounts");
        assert_eq!(parsed.columns.len(), 1);
        assert_eq!(parsed.columns[0].column, "owner_id");
        assert_eq!(parsed.columns[0].predicate, Predicate::Range);
    }
}
