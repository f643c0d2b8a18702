use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

use crate::snapshot::Scope;

const DEFAULT_CONFIG_PATH: &str = "/config/dblens.yaml";

const KIB: i64 = 1024;
const MIB: i64 = 1024 * KIB;
const GIB: i64 = 1024 * MIB;

/// Top-level configuration for the dblens engine.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "AppConfig::default_cluster")]
    pub cluster: String,
    #[serde(default)]
    pub dsn: String,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub ranker: RankerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    fn default_cluster() -> String {
        "local".into()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cluster: Self::default_cluster(),
            dsn: String::new(),
            schedule: ScheduleConfig::default(),
            limits: Limits::default(),
            collector: CollectorConfig::default(),
            timeouts: Timeouts::default(),
            analyzer: AnalyzerConfig::default(),
            ranker: RankerConfig::default(),
            llm: LlmConfig::default(),
            http: HttpConfig::default(),
            security: SecurityConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Scheduled analysis runs used by `watch`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "ScheduleConfig::default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Scopes analysed on every tick; an empty list means every schema.
    #[serde(default)]
    pub scopes: Vec<Scope>,
}

impl ScheduleConfig {
    const fn default_interval() -> Duration {
        Duration::from_secs(3600)
    }

    pub fn effective_scopes(&self) -> Vec<Scope> {
        if self.scopes.is_empty() {
            vec![Scope::all()]
        } else {
            self.scopes.clone()
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Self::default_interval(),
            scopes: Vec::new(),
        }
    }
}

/// Row limits that keep every introspection query bounded.
#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    #[serde(default = "Limits::default_max_tables")]
    pub max_tables: u32,
    #[serde(default = "Limits::default_max_columns")]
    pub max_columns: u32,
    #[serde(default = "Limits::default_max_indexes")]
    pub max_indexes: u32,
    #[serde(default = "Limits::default_max_digests")]
    pub max_digests: u32,
    /// Indexes smaller than this are not sized by the collector.
    #[serde(default)]
    pub index_size_floor_bytes: i64,
}

impl Limits {
    const fn default_max_tables() -> u32 {
        500
    }

    const fn default_max_columns() -> u32 {
        10_000
    }

    const fn default_max_indexes() -> u32 {
        2_000
    }

    const fn default_max_digests() -> u32 {
        200
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_tables: Self::default_max_tables(),
            max_columns: Self::default_max_columns(),
            max_indexes: Self::default_max_indexes(),
            max_digests: Self::default_max_digests(),
            index_size_floor_bytes: 0,
        }
    }
}

/// Retry policy for connection-level collection failures.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "CollectorConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(
        default = "CollectorConfig::default_retry_delay",
        with = "humantime_serde"
    )]
    pub retry_delay: Duration,
}

impl CollectorConfig {
    const fn default_max_retries() -> u32 {
        1
    }

    const fn default_retry_delay() -> Duration {
        Duration::from_secs(2)
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            retry_delay: Self::default_retry_delay(),
        }
    }
}

/// Session and collection time bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// Applied per statement through `max_execution_time`.
    #[serde(default = "Timeouts::default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    #[serde(default = "Timeouts::default_acquire", with = "humantime_serde")]
    pub acquire: Duration,
    #[serde(
        default = "Timeouts::default_collection_budget",
        with = "humantime_serde"
    )]
    pub collection_budget: Duration,
}

impl Timeouts {
    const fn default_statement_timeout_ms() -> u64 {
        3_000
    }

    const fn default_acquire() -> Duration {
        Duration::from_secs(5)
    }

    const fn default_collection_budget() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            statement_timeout_ms: Self::default_statement_timeout_ms(),
            acquire: Self::default_acquire(),
            collection_budget: Self::default_collection_budget(),
        }
    }
}

/// Index size thresholds mapped to severities.
#[derive(Debug, Clone, Deserialize)]
pub struct SizeTiers {
    #[serde(default = "SizeTiers::default_critical_bytes")]
    pub critical_bytes: i64,
    #[serde(default = "SizeTiers::default_high_bytes")]
    pub high_bytes: i64,
    #[serde(default = "SizeTiers::default_medium_bytes")]
    pub medium_bytes: i64,
}

impl SizeTiers {
    const fn default_critical_bytes() -> i64 {
        GIB
    }

    const fn default_high_bytes() -> i64 {
        100 * MIB
    }

    const fn default_medium_bytes() -> i64 {
        10 * MIB
    }
}

impl Default for SizeTiers {
    fn default() -> Self {
        Self {
            critical_bytes: Self::default_critical_bytes(),
            high_bytes: Self::default_high_bytes(),
            medium_bytes: Self::default_medium_bytes(),
        }
    }
}

/// Tuning constants for the heuristic rules.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default)]
    pub unused_max_reads: i64,
    #[serde(default = "AnalyzerConfig::default_min_index_size_bytes")]
    pub min_index_size_bytes: i64,
    #[serde(default)]
    pub size_tiers: SizeTiers,
    #[serde(
        default = "AnalyzerConfig::default_min_observation_window",
        with = "humantime_serde"
    )]
    pub min_observation_window: Duration,
    #[serde(default = "AnalyzerConfig::default_short_window_penalty")]
    pub short_window_penalty: f64,
    #[serde(default = "AnalyzerConfig::default_redundant_confidence")]
    pub redundant_confidence: f64,
    #[serde(default = "AnalyzerConfig::default_examined_ratio_threshold")]
    pub examined_ratio_threshold: f64,
    #[serde(default = "AnalyzerConfig::default_small_table_rows")]
    pub small_table_rows: i64,
    #[serde(default = "AnalyzerConfig::default_min_supporting_digests")]
    pub min_supporting_digests: usize,
    #[serde(default = "AnalyzerConfig::default_confidence_base")]
    pub confidence_base: f64,
    #[serde(default = "AnalyzerConfig::default_confidence_saturation")]
    pub confidence_saturation: usize,
    #[serde(default = "AnalyzerConfig::default_min_buffer_pool_bytes")]
    pub min_buffer_pool_bytes: i64,
    #[serde(default = "AnalyzerConfig::default_min_tmp_table_bytes")]
    pub min_tmp_table_bytes: i64,
    /// Tables below this many rows are not flagged for a missing primary key.
    #[serde(default = "AnalyzerConfig::default_primary_key_min_rows")]
    pub primary_key_min_rows: i64,
    #[serde(default = "AnalyzerConfig::default_large_table_bytes")]
    pub large_table_bytes: i64,
}

impl AnalyzerConfig {
    const fn default_min_index_size_bytes() -> i64 {
        MIB
    }

    const fn default_min_observation_window() -> Duration {
        Duration::from_secs(7 * 24 * 3600)
    }

    const fn default_short_window_penalty() -> f64 {
        0.5
    }

    const fn default_redundant_confidence() -> f64 {
        0.95
    }

    const fn default_examined_ratio_threshold() -> f64 {
        100.0
    }

    const fn default_small_table_rows() -> i64 {
        1_000
    }

    const fn default_min_supporting_digests() -> usize {
        2
    }

    const fn default_confidence_base() -> f64 {
        0.5
    }

    const fn default_confidence_saturation() -> usize {
        10
    }

    const fn default_min_buffer_pool_bytes() -> i64 {
        128 * MIB
    }

    const fn default_min_tmp_table_bytes() -> i64 {
        16 * MIB
    }

    const fn default_primary_key_min_rows() -> i64 {
        100
    }

    const fn default_large_table_bytes() -> i64 {
        GIB
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            unused_max_reads: 0,
            min_index_size_bytes: Self::default_min_index_size_bytes(),
            size_tiers: SizeTiers::default(),
            min_observation_window: Self::default_min_observation_window(),
            short_window_penalty: Self::default_short_window_penalty(),
            redundant_confidence: Self::default_redundant_confidence(),
            examined_ratio_threshold: Self::default_examined_ratio_threshold(),
            small_table_rows: Self::default_small_table_rows(),
            min_supporting_digests: Self::default_min_supporting_digests(),
            confidence_base: Self::default_confidence_base(),
            confidence_saturation: Self::default_confidence_saturation(),
            min_buffer_pool_bytes: Self::default_min_buffer_pool_bytes(),
            min_tmp_table_bytes: Self::default_min_tmp_table_bytes(),
            primary_key_min_rows: Self::default_primary_key_min_rows(),
            large_table_bytes: Self::default_large_table_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RankerConfig {
    #[serde(default = "RankerConfig::default_agreement_bonus")]
    pub agreement_bonus: f64,
}

impl RankerConfig {
    const fn default_agreement_bonus() -> f64 {
        0.1
    }
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            agreement_bonus: Self::default_agreement_bonus(),
        }
    }
}

/// Which provider backs LLM enrichment.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderKind {
    OpenAi,
    DeepSeek,
    OpenAiCompatible,
    Ollama,
    Gemini,
}

impl LlmProviderKind {
    pub fn requires_api_key(self) -> bool {
        matches!(
            self,
            LlmProviderKind::OpenAi | LlmProviderKind::DeepSeek | LlmProviderKind::Gemini
        )
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            LlmProviderKind::OpenAi => "https://api.openai.com/v1",
            LlmProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            LlmProviderKind::OpenAiCompatible => "http://localhost:8000/v1",
            LlmProviderKind::Ollama => "http://localhost:11434",
            LlmProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta/models",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            LlmProviderKind::OpenAi => "gpt-4o-mini",
            LlmProviderKind::DeepSeek => "deepseek-chat",
            LlmProviderKind::OpenAiCompatible => "local-model",
            LlmProviderKind::Ollama => "llama3.1",
            LlmProviderKind::Gemini => "gemini-1.5-flash",
        }
    }
}

/// Optional LLM enrichment.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "LlmConfig::default_provider")]
    pub provider: LlmProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Populated from `DBLENS_LLM_API_KEY` only.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "LlmConfig::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "LlmConfig::default_max_digests")]
    pub max_digests: usize,
    #[serde(default = "LlmConfig::default_temperature")]
    pub temperature: f32,
}

impl LlmConfig {
    const fn default_provider() -> LlmProviderKind {
        LlmProviderKind::Ollama
    }

    const fn default_timeout() -> Duration {
        Duration::from_secs(30)
    }

    const fn default_max_digests() -> usize {
        20
    }

    const fn default_temperature() -> f32 {
        0.1
    }

    pub fn model_name(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }

    pub fn endpoint(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.provider.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string()
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: Self::default_provider(),
            model: None,
            base_url: None,
            api_key: None,
            timeout: Self::default_timeout(),
            max_digests: Self::default_max_digests(),
            temperature: Self::default_temperature(),
        }
    }
}

/// HTTP listener configuration for the `watch` ops endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_bind")]
    pub bind: String,
}

impl HttpConfig {
    fn default_bind() -> String {
        "0.0.0.0:8282".to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Security guardrails enforced by the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub read_only_enforce: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            read_only_enforce: true,
        }
    }
}

/// Where recommendation history and the run audit are written.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Load configuration from YAML disk file, falling back to defaults + env overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("DBLENS_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    enforce_yaml_policy(&config)?;
    apply_env_overrides(&mut config)?;
    ensure_required_secrets(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => parse_yaml(&raw)
            .with_context(|| format!("failed to parse YAML config at {}", path.display()))
            .map(Some),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

fn parse_yaml(raw: &str) -> Result<AppConfig> {
    Ok(serde_yaml::from_str(raw)?)
}

fn enforce_yaml_policy(config: &AppConfig) -> Result<()> {
    if !config.dsn.trim().is_empty() {
        bail!(
            "Remove `dsn` from dblens YAML config; set the MySQL connection string via the DBLENS_DSN environment variable (see .env.sample)."
        );
    }
    if config.llm.api_key.is_some() {
        bail!(
            "Remove `llm.api_key` from dblens YAML config; set it via the DBLENS_LLM_API_KEY environment variable."
        );
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(cluster) = env::var("DBLENS_CLUSTER") {
        if !cluster.is_empty() {
            config.cluster = cluster;
        }
    }

    if let Ok(dir) = env::var("DBLENS_DATA_DIR") {
        if !dir.trim().is_empty() {
            config.storage.data_dir = Some(PathBuf::from(dir));
        }
    }

    match env::var("DBLENS_DSN") {
        Ok(dsn) => {
            if dsn.trim().is_empty() {
                bail!(
                    "Environment variable DBLENS_DSN is set but empty; populate it in your .env file."
                );
            }
            config.dsn = dsn;
        }
        Err(env::VarError::NotPresent) => {}
        Err(err) => return Err(err.into()),
    };

    match env::var("DBLENS_LLM_API_KEY") {
        Ok(key) if !key.trim().is_empty() => config.llm.api_key = Some(key),
        Ok(_) | Err(env::VarError::NotPresent) => {}
        Err(err) => return Err(err.into()),
    };

    Ok(())
}

fn ensure_required_secrets(config: &AppConfig) -> Result<()> {
    if config.llm.enabled && config.llm.provider.requires_api_key() && config.llm.api_key.is_none()
    {
        bail!(
            "LLM provider {:?} needs an API key. Set DBLENS_LLM_API_KEY or disable `llm.enabled`.",
            config.llm.provider
        );
    }
    Ok(())
}

/// Commands that talk to the database call this before building a pool.
pub fn require_dsn(config: &AppConfig) -> Result<()> {
    if config.dsn.trim().is_empty() {
        bail!(
            "Missing MySQL DSN. Set the DBLENS_DSN environment variable (see .env.sample). Secrets must not be stored in YAML."
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = parse_yaml("cluster: prod\n").unwrap();
        assert_eq!(config.cluster, "prod");
        assert_eq!(config.analyzer.min_index_size_bytes, MIB);
        assert_eq!(config.llm.timeout, Duration::from_secs(30));
        assert_eq!(config.collector.max_retries, 1);
        assert!(!config.llm.enabled);
    }

    #[test]
    fn humantime_durations_and_scopes_parse() {
        let raw = r#"
schedule:
  interval: 15m
  scopes:
    - schema: shop
      tables: [orders, customers]
analyzer:
  min_observation_window: 2d
llm:
  enabled: true
  provider: gemini
  timeout: 5s
"#;
        let config = parse_yaml(raw).unwrap();
        assert_eq!(config.schedule.interval, Duration::from_secs(900));
        assert_eq!(config.schedule.scopes[0].tables.len(), 2);
        assert_eq!(
            config.analyzer.min_observation_window,
            Duration::from_secs(2 * 86_400)
        );
        assert_eq!(config.llm.provider, LlmProviderKind::Gemini);
        assert_eq!(config.llm.timeout, Duration::from_secs(5));
    }

    #[test]
    fn secrets_in_yaml_are_rejected() {
        let config = parse_yaml("dsn: mysql://root@localhost/shop\n").unwrap();
        assert!(enforce_yaml_policy(&config).is_err());

        let config = parse_yaml("llm:\n  api_key: sk-123\n").unwrap();
        assert!(enforce_yaml_policy(&config).is_err());
    }

    #[test]
    fn cloud_provider_without_key_is_rejected() {
        let mut config = AppConfig::default();
        config.llm.enabled = true;
        config.llm.provider = LlmProviderKind::OpenAi;
        assert!(ensure_required_secrets(&config).is_err());

        config.llm.provider = LlmProviderKind::Ollama;
        assert!(ensure_required_secrets(&config).is_ok());
    }

    #[test]
    fn empty_schedule_scopes_mean_everything() {
        let schedule = ScheduleConfig::default();
        assert_eq!(schedule.effective_scopes(), vec![Scope::all()]);
    }
}
