use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::analyzer::sql::{self, ActionStatement, TableRef};
use crate::llm::{AdapterError, AnalysisContext, TableSummary};
use crate::recommendations::{Category, Recommendation, Severity, Source, SuggestedAction, Target};

static THINK_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:think|thinking|reasoning)>.*?(?:</(?:think|thinking|reasoning)>|\z)")
        .expect("valid regex")
});
#[derive(Debug, Deserialize)]
struct RawResponse {
    recommendations: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawItem {
    category: Category,
    target: RawTarget,
    rationale: String,
    #[serde(default)]
    suggested_action: Option<String>,
    confidence: f64,
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    digests: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    #[serde(default)]
    schema: Option<String>,
    table: String,
    #[serde(default)]
    index: Option<String>,
    #[serde(default)]
    columns: Vec<String>,
}

/// Why a single provider item could not be trusted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("table {0} is not part of the analyzed schema")]
    UnknownTable(String),
    #[error("column {column} does not exist on {table}")]
    UnknownColumn { table: String, column: String },
    #[error("index {index} does not exist on {table}")]
    UnknownIndex { table: String, index: String },
    #[error("{0} recommendations must name an existing index")]
    MissingIndexName(Category),
    #[error("suggested index column {column} does not exist on {table}")]
    UnknownActionColumn { table: String, column: String },
    #[error("query rewrites must reference an analyzed digest")]
    RewriteWithoutDigest,
    #[error("rewrite reads {found} but digest {digest} reads {expected}")]
    RewriteTables {
        digest: String,
        expected: String,
        found: String,
    },
}

/// Decode a provider answer. Any deviation from the response schema rejects
/// the whole answer.
pub(crate) fn parse(raw: &str) -> Result<Vec<RawItem>, AdapterError> {
    let cleaned = strip_code_fences(&strip_think_blocks(raw));
    let json = extract_json(&cleaned)
        .ok_or_else(|| AdapterError::InvalidResponse("no JSON object in response".into()))?;
    let response: RawResponse = serde_json::from_str(json)
        .map_err(|err| AdapterError::InvalidResponse(err.to_string()))?;

    for (idx, item) in response.recommendations.iter().enumerate() {
        if !item.confidence.is_finite() || !(0.0..=1.0).contains(&item.confidence) {
            return Err(AdapterError::InvalidResponse(format!(
                "recommendation {idx} has confidence {} outside [0, 1]",
                item.confidence
            )));
        }
        if item.rationale.trim().is_empty() {
            return Err(AdapterError::InvalidResponse(format!(
                "recommendation {idx} has an empty rationale"
            )));
        }
    }
    Ok(response.recommendations)
}

/// Validate items against the context. Items that fail are downgraded to
/// zero-confidence advisories without an executable action.
pub(crate) fn into_recommendations(
    items: Vec<RawItem>,
    context: &AnalysisContext,
) -> Vec<Recommendation> {
    items
        .into_iter()
        .map(|item| match validate(&item, context) {
            Ok(rec) => rec,
            Err(err) => {
                warn!(
                    table = %item.target.table,
                    category = %item.category,
                    error = %err,
                    "llm recommendation failed validation; downgraded to advisory"
                );
                downgrade(item, context, &err)
            }
        })
        .collect()
}

fn validate(item: &RawItem, context: &AnalysisContext) -> Result<Recommendation, ValidationError> {
    let raw = &item.target;
    let table = context
        .find_table(raw.schema.as_deref(), &raw.table)
        .ok_or_else(|| ValidationError::UnknownTable(qualified(raw)))?;

    let mut columns = Vec::with_capacity(raw.columns.len());
    for column in &raw.columns {
        let known = table
            .column(column)
            .ok_or_else(|| ValidationError::UnknownColumn {
                table: table.table.clone(),
                column: column.clone(),
            })?;
        columns.push(known.name.clone());
    }

    let index = match (&raw.index, item.category.targets_existing_index()) {
        (Some(name), _) => {
            let known = table.index(name).ok_or_else(|| ValidationError::UnknownIndex {
                table: table.table.clone(),
                index: name.clone(),
            })?;
            if item.category.targets_existing_index() {
                columns = known.columns.clone();
            }
            Some(known.name.clone())
        }
        (None, true) => return Err(ValidationError::MissingIndexName(item.category)),
        (None, false) => None,
    };

    let digests = item
        .digests
        .iter()
        .filter(|d| context.has_digest(d))
        .cloned()
        .collect::<Vec<_>>();
    if item.category == Category::QueryRewrite && digests.is_empty() {
        return Err(ValidationError::RewriteWithoutDigest);
    }

    let target = Target {
        schema: table.schema.clone(),
        table: table.table.clone(),
        index,
        columns,
    };
    let action = classify_action(
        item.category,
        item.suggested_action.as_deref(),
        table,
        &target,
        &digests,
        context,
    )?;

    Ok(Recommendation::new(
        item.category,
        item.severity.unwrap_or(Severity::Medium),
        item.confidence,
        item.rationale.trim(),
        action,
        Source::Llm,
        target,
    )
    .with_digests(digests))
}

fn downgrade(item: RawItem, context: &AnalysisContext, err: &ValidationError) -> Recommendation {
    let schema = item
        .target
        .schema
        .clone()
        .or_else(|| context.scope.schema.clone())
        .unwrap_or_default();
    let target = Target {
        schema,
        table: item.target.table,
        index: item.target.index,
        columns: item.target.columns,
    };
    Recommendation::new(
        Category::Advisory,
        Severity::Low,
        0.0,
        item.rationale.trim(),
        Some(SuggestedAction::Note(format!(
            "Not verified against the schema ({err}); review manually before acting."
        ))),
        Source::Llm,
        target,
    )
}

/// Keeps a suggested statement as executable SQL only when it has the one
/// shape its category allows and touches the validated target. Anything else
/// is kept as a note.
fn classify_action(
    category: Category,
    action: Option<&str>,
    table: &TableSummary,
    target: &Target,
    digests: &[String],
    context: &AnalysisContext,
) -> Result<Option<SuggestedAction>, ValidationError> {
    let Some(text) = action.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    let statement = match category {
        Category::Advisory | Category::Configuration => None,
        _ => sql::read_action(text),
    };
    let on_target = |t: &TableRef| t.is(&table.schema, &table.table);

    let executable = match (category, statement) {
        (Category::MissingIndex, Some(ActionStatement::CreateIndex { table: t, columns }))
            if on_target(&t) =>
        {
            for column in &columns {
                if table.column(column).is_none() {
                    return Err(ValidationError::UnknownActionColumn {
                        table: table.table.clone(),
                        column: column.clone(),
                    });
                }
            }
            target.columns.is_empty() || same_names(&columns, &target.columns)
        }
        (
            Category::UnusedIndex | Category::RedundantIndex,
            Some(ActionStatement::DropIndex { table: Some(t), index }),
        ) => {
            on_target(&t)
                && target
                    .index
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(&index))
        }
        (Category::QueryRewrite, Some(ActionStatement::Select { tables })) => {
            check_rewrite_tables(&tables, digests, context)?;
            true
        }
        _ => false,
    };

    Ok(Some(if executable {
        SuggestedAction::Sql(text.to_string())
    } else {
        SuggestedAction::Note(text.to_string())
    }))
}

fn same_names(a: &[String], b: &[String]) -> bool {
    let lower = |names: &[String]| {
        let mut names: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
        names.sort();
        names.dedup();
        names
    };
    lower(a) == lower(b)
}

fn table_names<'a>(tables: impl IntoIterator<Item = &'a TableRef>) -> Vec<String> {
    let mut names: Vec<String> = tables.into_iter().map(|t| t.table.to_lowercase()).collect();
    names.sort();
    names.dedup();
    names
}

/// A rewrite must read the same tables as every digest it claims to replace.
fn check_rewrite_tables(
    rewrite: &[TableRef],
    digests: &[String],
    context: &AnalysisContext,
) -> Result<(), ValidationError> {
    let found = table_names(rewrite);
    for digest in context.digests.iter().filter(|d| digests.contains(&d.digest)) {
        let expected = table_names(&sql::parse(&digest.text).tables);
        if !expected.is_empty() && expected != found {
            return Err(ValidationError::RewriteTables {
                digest: digest.digest.clone(),
                expected: expected.join(", "),
                found: found.join(", "),
            });
        }
    }
    Ok(())
}

fn qualified(target: &RawTarget) -> String {
    match &target.schema {
        Some(schema) => format!("{schema}.{}", target.table),
        None => target.table.clone(),
    }
}

fn strip_think_blocks(input: &str) -> String {
    THINK_BLOCK.replace_all(input, "").into_owned()
}

fn strip_code_fences(input: &str) -> String {
    input
        .replace("```json", "")
        .replace("```JSON", "")
        .replace("```", "")
        .trim()
        .to_string()
}

fn extract_json(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let end = input.rfind('}')?;
    (end > start).then(|| &input[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ColumnSummary, DigestSummary, IndexSummary};
    use crate::snapshot::Scope;

    fn context() -> AnalysisContext {
        AnalysisContext {
            scope: Scope::schema("shop"),
            tables: vec![TableSummary {
                schema: "shop".into(),
                table: "orders".into(),
                row_estimate: Some(1_000_000),
                columns: ["id", "user_id", "status"]
                    .into_iter()
                    .map(|name| ColumnSummary {
                        name: name.into(),
                        data_type: "int".into(),
                        nullable: false,
                    })
                    .collect(),
                indexes: vec![IndexSummary {
                    name: "idx_status".into(),
                    columns: vec!["status".into()],
                    unique: false,
                    reads: Some(0),
                    size_bytes: Some(1 << 20),
                }],
            }],
            digests: Vec::new(),
        }
    }

    fn item_json(columns: &str, action: &str) -> String {
        format!(
            r#"{{"recommendations":[{{"category":"missing_index","target":{{"table":"orders","columns":{columns}}},"rationale":"full scans on user_id","suggested_action":"{action}","confidence":0.7}}]}}"#
        )
    }

    #[test]
    fn strips_reasoning_and_fences_before_parsing() {
        let raw = format!(
            "<think>The orders table {{ is scanned }}</think>\n```json\n{}\n```",
            item_json(r#"["user_id"]"#, "CREATE INDEX idx_u ON orders (user_id)")
        );
        let items = parse(&raw).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn out_of_range_confidence_rejects_everything() {
        let raw = item_json(r#"["user_id"]"#, "").replace("0.7", "1.5");
        assert!(matches!(parse(&raw), Err(AdapterError::InvalidResponse(_))));
    }

    #[test]
    fn empty_rationale_rejects_everything() {
        let raw = item_json(r#"["user_id"]"#, "").replace("full scans on user_id", "  ");
        assert!(matches!(parse(&raw), Err(AdapterError::InvalidResponse(_))));
    }

    #[test]
    fn unknown_category_rejects_everything() {
        let raw = item_json(r#"["user_id"]"#, "").replace("missing_index", "drop_table");
        assert!(matches!(parse(&raw), Err(AdapterError::InvalidResponse(_))));
        assert!(parse("no json here").is_err());
    }

    #[test]
    fn valid_items_keep_their_action() {
        let items = parse(&item_json(
            r#"["USER_ID"]"#,
            "CREATE INDEX idx_u ON orders (user_id)",
        ))
        .unwrap();
        let recs = into_recommendations(items, &context());
        assert_eq!(recs[0].category, Category::MissingIndex);
        assert_eq!(recs[0].source, Source::Llm);
        assert_eq!(recs[0].target.schema, "shop");
        assert_eq!(recs[0].target.columns, vec!["user_id"]);
        assert!(recs[0].suggested_action.as_ref().unwrap().is_sql());
    }

    #[test]
    fn hallucinated_columns_are_downgraded() {
        let items = parse(&item_json(r#"["customer_id"]"#, "")).unwrap();
        let recs = into_recommendations(items, &context());
        assert_eq!(recs[0].category, Category::Advisory);
        assert_eq!(recs[0].confidence, 0.0);
        assert!(!recs[0].suggested_action.as_ref().unwrap().is_sql());
    }

    #[test]
    fn action_columns_must_exist() {
        let items = parse(&item_json(
            r#"["user_id"]"#,
            "ALTER TABLE orders ADD INDEX idx_x (user_id, created_at)",
        ))
        .unwrap();
        let recs = into_recommendations(items, &context());
        assert_eq!(recs[0].category, Category::Advisory);
        assert!(recs[0].suggested_action.as_ref().unwrap().text().contains("created_at"));
    }

    #[test]
    fn index_targets_take_columns_from_the_schema() {
        let raw = r#"{"recommendations":[{"category":"unused_index","target":{"schema":"shop","table":"orders","index":"IDX_STATUS"},"rationale":"no reads","confidence":0.6,"severity":"high"}]}"#;
        let recs = into_recommendations(parse(raw).unwrap(), &context());
        assert_eq!(recs[0].category, Category::UnusedIndex);
        assert_eq!(recs[0].target.index.as_deref(), Some("idx_status"));
        assert_eq!(recs[0].target.columns, vec!["status"]);
        assert_eq!(recs[0].severity, Severity::High);

        let missing = raw.replace(r#","index":"IDX_STATUS""#, "");
        let recs = into_recommendations(parse(&missing).unwrap(), &context());
        assert_eq!(recs[0].category, Category::Advisory);
    }

    fn with_digest(mut context: AnalysisContext, id: &str, text: &str) -> AnalysisContext {
        context.digests.push(DigestSummary {
            digest: id.into(),
            schema: Some("shop".into()),
            text: text.into(),
            exec_count: 100,
            total_latency_ms: 1_000.0,
            avg_latency_ms: 10.0,
            rows_examined: 1_000_000,
            rows_returned: 100,
            examined_ratio: 10_000.0,
            no_index_used: 100,
        });
        context
    }

    fn single(raw: &str, context: &AnalysisContext) -> Recommendation {
        into_recommendations(parse(raw).unwrap(), context).remove(0)
    }

    #[test]
    fn prose_actions_are_notes() {
        let rec = single(
            &item_json(r#"["user_id"]"#, "Consider rewriting the OR as a UNION"),
            &context(),
        );
        assert_eq!(rec.category, Category::MissingIndex);
        assert_eq!(
            rec.suggested_action,
            Some(SuggestedAction::Note("Consider rewriting the OR as a UNION".into()))
        );
        let rec = single(&item_json(r#"["user_id"]"#, "   "), &context());
        assert_eq!(rec.suggested_action, None);
    }

    #[test]
    fn destructive_statement_on_an_index_item_is_a_note() {
        let rec = single(&item_json(r#"["user_id"]"#, "DROP TABLE orders"), &context());
        assert_eq!(rec.category, Category::MissingIndex);
        assert_eq!(
            rec.suggested_action,
            Some(SuggestedAction::Note("DROP TABLE orders".into()))
        );
    }

    #[test]
    fn advisory_items_never_carry_sql() {
        let raw = r#"{"recommendations":[{"category":"advisory","target":{"table":"orders"},"rationale":"table is hot","suggested_action":"DROP TABLE orders","confidence":0.4}]}"#;
        let rec = single(raw, &context());
        assert_eq!(rec.category, Category::Advisory);
        assert!(!rec.suggested_action.as_ref().unwrap().is_sql());

        let raw = raw.replace("DROP TABLE orders", "CREATE INDEX i ON orders (status)");
        assert!(!single(&raw, &context()).suggested_action.unwrap().is_sql());
    }

    #[test]
    fn index_statement_must_touch_the_target_table() {
        let rec = single(
            &item_json(r#"["id"]"#, "CREATE INDEX idx_c ON customers (id)"),
            &context(),
        );
        assert!(!rec.suggested_action.unwrap().is_sql());

        let rec = single(
            &item_json(r#"["user_id"]"#, "CREATE INDEX idx_s ON shop.orders (status)"),
            &context(),
        );
        assert!(!rec.suggested_action.unwrap().is_sql());
    }

    #[test]
    fn drop_must_name_the_target_index() {
        let raw = r#"{"recommendations":[{"category":"unused_index","target":{"table":"orders","index":"idx_status"},"rationale":"no reads","suggested_action":"DROP INDEX idx_status ON shop.orders","confidence":0.6}]}"#;
        assert!(single(raw, &context()).suggested_action.unwrap().is_sql());

        let other = raw.replace("DROP INDEX idx_status", "DROP INDEX idx_other");
        assert!(!single(&other, &context()).suggested_action.unwrap().is_sql());

        let create = raw.replace(
            "DROP INDEX idx_status ON shop.orders",
            "CREATE INDEX idx_status2 ON orders (status)",
        );
        assert!(!single(&create, &context()).suggested_action.unwrap().is_sql());
    }

    #[test]
    fn rewrite_must_read_the_digest_tables() {
        let context = with_digest(
            context(),
            "d1",
            "SELECT * FROM `orders` WHERE `status` = ? OR `user_id` = ?",
        );
        let raw = r#"{"recommendations":[{"category":"query_rewrite","target":{"table":"orders"},"rationale":"OR defeats the index","suggested_action":"SELECT * FROM orders WHERE status = ? UNION SELECT * FROM orders WHERE user_id = ?","confidence":0.5,"digests":["d1"]}]}"#;
        let rec = single(raw, &context);
        assert_eq!(rec.category, Category::QueryRewrite);
        assert!(rec.suggested_action.unwrap().is_sql());

        let drifted = raw.replace(
            "UNION SELECT * FROM orders WHERE user_id = ?",
            "UNION SELECT * FROM archived_orders WHERE user_id = ?",
        );
        let rec = single(&drifted, &context);
        assert_eq!(rec.category, Category::Advisory);
        assert!(rec.suggested_action.unwrap().text().contains("archived_orders"));

        let unanchored = raw.replace(r#""digests":["d1"]"#, r#""digests":["nope"]"#);
        assert_eq!(single(&unanchored, &context).category, Category::Advisory);

        let destructive = raw.replace(
            "SELECT * FROM orders WHERE status = ? UNION SELECT * FROM orders WHERE user_id = ?",
            "DELETE FROM orders WHERE status = ?",
        );
        let rec = single(&destructive, &context);
        assert_eq!(rec.category, Category::QueryRewrite);
        assert!(!rec.suggested_action.unwrap().is_sql());
    }
}
