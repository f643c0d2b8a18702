use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::snapshot::{MissingSection, Scope};

const FINGERPRINT_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_4a2e_9b07_4c3d_8e55_2f0a_b1c4_d7e9);

/// Kind of recommendation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    UnusedIndex,
    RedundantIndex,
    MissingIndex,
    QueryRewrite,
    Configuration,
    Advisory,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::UnusedIndex,
        Category::RedundantIndex,
        Category::MissingIndex,
        Category::QueryRewrite,
        Category::Configuration,
        Category::Advisory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::UnusedIndex => "unused_index",
            Category::RedundantIndex => "redundant_index",
            Category::MissingIndex => "missing_index",
            Category::QueryRewrite => "query_rewrite",
            Category::Configuration => "configuration",
            Category::Advisory => "advisory",
        }
    }

    /// Lower value sorts first when severity and confidence tie.
    pub fn priority(self) -> u8 {
        match self {
            Category::UnusedIndex => 0,
            Category::RedundantIndex => 1,
            Category::MissingIndex => 2,
            Category::QueryRewrite => 3,
            Category::Configuration => 4,
            Category::Advisory => 5,
        }
    }

    /// Categories that point at an existing index rather than a column set.
    pub fn targets_existing_index(self) -> bool {
        matches!(self, Category::UnusedIndex | Category::RedundantIndex)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unused_index" => Ok(Category::UnusedIndex),
            "redundant_index" => Ok(Category::RedundantIndex),
            "missing_index" => Ok(Category::MissingIndex),
            "query_rewrite" => Ok(Category::QueryRewrite),
            "configuration" => Ok(Category::Configuration),
            "advisory" => Ok(Category::Advisory),
            other => Err(ParseEnumError::new("category", other)),
        }
    }
}

/// Severity level for recommendations
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(ParseEnumError::new("severity", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Heuristic,
    Llm,
    Merged,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Applied,
    Dismissed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Applied => "applied",
            Status::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Status::Pending),
            "applied" => Ok(Status::Applied),
            "dismissed" => Ok(Status::Dismissed),
            other => Err(ParseEnumError::new("status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// What the operator is asked to do. Only `Sql` is executable DDL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "text", rename_all = "lowercase")]
pub enum SuggestedAction {
    Sql(String),
    Note(String),
}

impl SuggestedAction {
    pub fn is_sql(&self) -> bool {
        matches!(self, SuggestedAction::Sql(_))
    }

    pub fn text(&self) -> &str {
        match self {
            SuggestedAction::Sql(text) | SuggestedAction::Note(text) => text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub schema: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
}

impl Target {
    pub fn index(
        schema: impl Into<String>,
        table: impl Into<String>,
        index: impl Into<String>,
        columns: Vec<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            index: Some(index.into()),
            columns,
        }
    }

    pub fn columns(schema: impl Into<String>, table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            index: None,
            columns,
        }
    }

    /// A server-wide setting rather than a table.
    pub fn server_variable(name: impl Into<String>) -> Self {
        Self {
            schema: String::new(),
            table: String::new(),
            index: None,
            columns: vec![name.into()],
        }
    }
}

/// An index or query recommendation with rationale and confidence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub id: Uuid,
    pub category: Category,
    pub severity: Severity,
    pub confidence: f64,
    pub rationale: String,
    pub suggested_action: Option<SuggestedAction>,
    pub source: Source,
    pub status: Status,
    pub target: Target,
    pub supporting_digests: usize,
    #[serde(default)]
    pub digests: Vec<String>,
}

impl Recommendation {
    /// Builds a pending recommendation whose id is the fingerprint of its target.
    pub fn new(
        category: Category,
        severity: Severity,
        confidence: f64,
        rationale: impl Into<String>,
        suggested_action: Option<SuggestedAction>,
        source: Source,
        target: Target,
    ) -> Self {
        Self {
            id: fingerprint(category, &target),
            category,
            severity,
            confidence: clamp_confidence(confidence),
            rationale: rationale.into(),
            suggested_action,
            source,
            status: Status::Pending,
            target,
            supporting_digests: 0,
            digests: Vec::new(),
        }
    }

    pub fn with_digests<I, S>(mut self, digests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids: Vec<String> = digests.into_iter().map(Into::into).collect();
        ids.sort();
        ids.dedup();
        self.supporting_digests = ids.len();
        self.digests = ids;
        self
    }

    pub fn fingerprint(&self) -> Uuid {
        self.id
    }
}

/// Stable identity of a recommendation across runs.
///
/// Lower-cased `category|schema|table|index|columns`. Column sets are sorted
/// for categories that propose new structures; existing indexes keep their
/// column order and contribute their name.
pub fn fingerprint(category: Category, target: &Target) -> Uuid {
    let mut columns: Vec<String> = target.columns.iter().map(|c| c.to_lowercase()).collect();
    if !category.targets_existing_index() {
        columns.sort();
        columns.dedup();
    }
    let index = if category.targets_existing_index() {
        target.index.as_deref().unwrap_or("").to_lowercase()
    } else {
        String::new()
    };
    let key = format!(
        "{}|{}|{}|{}|{}",
        category.as_str(),
        target.schema.to_lowercase(),
        target.table.to_lowercase(),
        index,
        columns.join(",")
    );
    Uuid::new_v5(&FINGERPRINT_NAMESPACE, key.as_bytes())
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Scheduled,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Timeout,
    Unavailable,
    InvalidResponse,
    BackendError,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Timeout => "timeout",
            SkipReason::Unavailable => "unavailable",
            SkipReason::InvalidResponse => "invalid_response",
            SkipReason::BackendError => "backend_error",
        }
    }
}

/// Outcome of the optional LLM enrichment step of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Succeeded { provider: String, candidates: usize },
    Skipped { provider: String, reason: SkipReason },
    NotAttempted,
}

impl EnrichmentStatus {
    pub fn label(&self) -> &'static str {
        match self {
            EnrichmentStatus::Succeeded { .. } => "succeeded",
            EnrichmentStatus::Skipped { .. } => "skipped",
            EnrichmentStatus::NotAttempted => "not_attempted",
        }
    }
}

impl fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrichmentStatus::Succeeded { .. } => f.write_str("succeeded"),
            EnrichmentStatus::Skipped { reason, .. } => write!(f, "skipped ({})", reason.as_str()),
            EnrichmentStatus::NotAttempted => f.write_str("not attempted"),
        }
    }
}

/// Audit record of one analysis run. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub trigger: Trigger,
    pub scope: Scope,
    pub snapshot_id: Uuid,
    pub snapshot_complete: bool,
    #[serde(default)]
    pub missing_sections: Vec<MissingSection>,
    #[serde(default)]
    pub recommendation_ids: Vec<Uuid>,
    pub provider: Option<String>,
    pub enrichment: EnrichmentStatus,
    pub duration_ms: u64,
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

pub(crate) fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

pub(crate) fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = 1024 * KB;
    const GB: i64 = 1024 * MB;
    const TB: i64 = 1024 * GB;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

pub(crate) fn format_number(n: i64) -> String {
    let s = n.unsigned_abs().to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    if n < 0 {
        result.push('-');
    }
    result.chars().rev().collect()
}
