//! Service configuration loaded from YAML, with environment override.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rca-hub/rca-hub.yaml";
/// Environment variable overriding the configuration file path.
pub const CONFIG_PATH_ENV: &str = "INFER_CONFIG_PATH";

fn default_data_agent() -> String {
    "gala_gopher".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Metric-id prefix of the collection agent.
    #[serde(default = "default_data_agent")]
    pub data_agent: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_agent: default_data_agent(),
        }
    }
}

fn default_consumer_to() -> u64 {
    5
}

/// One consumed or produced topic.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TopicConfig {
    pub topic_id: String,
    #[serde(default)]
    pub group_id: String,
    /// Per-stream consumer poll timeout, seconds.
    #[serde(default = "default_consumer_to")]
    pub consumer_to: u64,
}

/// Broker connection and topic layout.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct KafkaConfig {
    pub server: String,
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub abnormal_kpi_topic: TopicConfig,
    #[serde(default)]
    pub abnormal_metric_topic: TopicConfig,
    #[serde(default)]
    pub metadata_topic: TopicConfig,
    #[serde(default)]
    pub inference_topic: TopicConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArangoConfig {
    pub url: String,
    pub db_name: String,
}

impl Default for ArangoConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8529".to_string(),
            db_name: "spider".to_string(),
        }
    }
}

fn default_range_api() -> String {
    "/api/v1/query_range".to_string()
}

fn default_step() -> i64 {
    5
}

fn default_sample_duration() -> i64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusConfig {
    pub base_url: String,
    #[serde(default = "default_range_api")]
    pub range_api: String,
    /// Sampling step, seconds.
    #[serde(default = "default_step")]
    pub step: i64,
    /// Length of the fetched window, seconds.
    #[serde(default = "default_sample_duration")]
    pub sample_duration: i64,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090".to_string(),
            range_api: default_range_api(),
            step: default_step(),
            sample_duration: default_sample_duration(),
        }
    }
}

fn default_valid_duration() -> i64 {
    120
}

fn default_aging_duration() -> i64 {
    600
}

fn default_topo_depth() -> i64 {
    10
}

fn default_tolerated_bias() -> i64 {
    120
}

fn default_infer_policy() -> String {
    "dfs".to_string()
}

fn default_root_topk() -> usize {
    3
}

fn default_rho() -> f64 {
    0.05
}

fn default_random_walk_round() -> u64 {
    10_000
}

fn default_kpi_poll_interval() -> u64 {
    30
}

fn default_rule_path() -> PathBuf {
    PathBuf::from("/etc/rca-hub/infer-rule.yaml")
}

fn default_keyword_path() -> PathBuf {
    PathBuf::from("/etc/rca-hub/cause-keyword.yaml")
}

fn default_ext_meta_path() -> PathBuf {
    PathBuf::from("/etc/rca-hub/ext-observe-meta.yaml")
}

/// Inference tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct InferSettings {
    #[serde(default = "default_valid_duration")]
    pub evt_valid_duration: i64,
    #[serde(default)]
    pub evt_future_duration: i64,
    #[serde(default = "default_aging_duration")]
    pub evt_aging_duration: i64,
    #[serde(default = "default_topo_depth")]
    pub topo_depth: i64,
    #[serde(default = "default_tolerated_bias")]
    pub tolerated_bias: i64,
    #[serde(default = "default_infer_policy")]
    pub infer_policy: String,
    #[serde(default = "default_root_topk")]
    pub root_topk: usize,
    #[serde(default = "default_rho")]
    pub rho: f64,
    #[serde(default = "default_random_walk_round")]
    pub random_walk_round: u64,
    /// Seconds to sleep when no KPI is queued.
    #[serde(default = "default_kpi_poll_interval")]
    pub kpi_poll_interval: u64,
    #[serde(default = "default_rule_path")]
    pub infer_rule_path: PathBuf,
    #[serde(default = "default_keyword_path")]
    pub cause_keyword_path: PathBuf,
    #[serde(default = "default_ext_meta_path")]
    pub ext_observe_meta_path: PathBuf,
}

impl Default for InferSettings {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("defaults are valid")
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_size() -> u64 {
    10
}

fn default_backup_count() -> u32 {
    10
}

/// Logging settings. Rotation by size/backup count is delegated to the
/// process supervisor; the values are accepted for compatibility.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            log_level: default_log_level(),
            max_size: default_max_size(),
            backup_count: default_backup_count(),
        }
    }
}

/// Full service configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InferConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub arangodb: ArangoConfig,
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    #[serde(default)]
    pub infer: InferSettings,
    #[serde(default)]
    pub log: LogConfig,
}

impl InferConfig {
    /// Loads configuration from the explicit path, the `INFER_CONFIG_PATH`
    /// environment variable, or the default location, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("failed to parse config file")
    }
}
