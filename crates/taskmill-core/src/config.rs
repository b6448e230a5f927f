//! Configuration management for taskmill
//!
//! Handles loading and validation of `taskmill.toml`. Every section is
//! optional; missing keys fall back to the defaults below.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,

    /// Search backend connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Batching and in-memory retry
    #[serde(default)]
    pub indexing: IndexingConfig,

    /// Durable failure queue
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Index naming and rollover thresholds
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Periodic maintenance intervals
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Environment name; the write alias is `{index_prefix}-{env}`
    #[serde(default = "default_env")]
    pub env: String,

    /// Data directory path
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            env: default_env(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_env() -> String {
    "default".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("taskmill"))
        .unwrap_or_else(|| PathBuf::from(".taskmill"))
}

/// Which backend implementation to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store, useful for dry runs and tests
    Memory,
    /// Elasticsearch-compatible REST endpoint
    #[default]
    Http,
}

/// Search backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    #[serde(default = "default_backend_url")]
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries for administrative and search calls before giving up
    #[serde(default = "default_backend_max_retries")]
    pub max_retries: u32,

    /// One backoff unit; the wait before retry `n` is `2^n` units
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,

    /// Page size for scroll queries
    #[serde(default = "default_search_page_size")]
    pub search_page_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            url: default_backend_url(),
            username: None,
            password: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_backend_max_retries(),
            backoff_unit_ms: default_backoff_unit_ms(),
            search_page_size: default_search_page_size(),
        }
    }
}

impl BackendConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_backend_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_backend_max_retries() -> u32 {
    3
}

fn default_backoff_unit_ms() -> u64 {
    1000
}

fn default_search_page_size() -> usize {
    1000
}

/// Bulk indexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// A batch closes once its estimated size exceeds this many bytes
    #[serde(default = "default_bulk_max_bytes")]
    pub bulk_max_bytes: usize,

    /// Maximum batches in flight at once
    #[serde(default = "default_indexing_threads")]
    pub indexing_threads: usize,

    /// In-memory retry rounds before a batch goes to disk
    #[serde(default = "default_indexing_max_retries")]
    pub max_retries: u32,

    /// Capacity of the in-memory retry queue; offers beyond it are dropped
    #[serde(default = "default_retry_queue_capacity")]
    pub retry_queue_capacity: usize,

    /// Days after completion before a task becomes eligible for deletion
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,

    #[serde(default = "default_max_string_chars")]
    pub max_string_chars: usize,

    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,

    /// Seconds an indexed orphan may stay resident while its parent is unknown
    #[serde(default = "default_orphan_max_age_secs")]
    pub orphan_max_age_secs: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            bulk_max_bytes: default_bulk_max_bytes(),
            indexing_threads: default_indexing_threads(),
            max_retries: default_indexing_max_retries(),
            retry_queue_capacity: default_retry_queue_capacity(),
            ttl_days: default_ttl_days(),
            max_string_chars: default_max_string_chars(),
            max_text_chars: default_max_text_chars(),
            orphan_max_age_secs: default_orphan_max_age_secs(),
        }
    }
}

fn default_bulk_max_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_indexing_threads() -> usize {
    10
}

fn default_indexing_max_retries() -> u32 {
    3
}

fn default_retry_queue_capacity() -> usize {
    100_000
}

fn default_ttl_days() -> u32 {
    90
}

fn default_max_string_chars() -> usize {
    8000
}

fn default_max_text_chars() -> usize {
    32766
}

fn default_orphan_max_age_secs() -> u64 {
    600
}

/// Durable failure queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// SQLite file; defaults to `{data_dir}/failed_bulks.db`
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_max_insert_tries")]
    pub max_insert_tries: u32,

    /// Upper bound on batches returned by one fetch
    #[serde(default = "default_max_fetched_bulks")]
    pub max_fetched_bulks_in_one_time: usize,

    /// A batch fetched this many times is dropped instead of persisted again
    #[serde(default = "default_max_bulk_fetches")]
    pub max_bulk_fetches: u32,

    #[serde(default = "default_insert_retry_delay_ms")]
    pub insert_retry_delay_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            max_insert_tries: default_max_insert_tries(),
            max_fetched_bulks_in_one_time: default_max_fetched_bulks(),
            max_bulk_fetches: default_max_bulk_fetches(),
            insert_retry_delay_ms: default_insert_retry_delay_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_insert_tries() -> u32 {
    10
}

fn default_max_fetched_bulks() -> usize {
    100
}

fn default_max_bulk_fetches() -> u32 {
    3
}

fn default_insert_retry_delay_ms() -> u64 {
    50
}

/// Index lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,

    #[serde(default = "default_max_index_age_days")]
    pub max_index_age_days: u32,

    #[serde(default = "default_max_index_size_gb")]
    pub max_index_size_gb: u32,

    #[serde(default = "default_max_index_docs")]
    pub max_index_docs: u64,

    #[serde(default = "default_shards")]
    pub shards: u32,

    #[serde(default = "default_replicas")]
    pub replicas: u32,

    #[serde(default = "default_max_total_fields")]
    pub max_total_fields: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            index_prefix: default_index_prefix(),
            max_index_age_days: default_max_index_age_days(),
            max_index_size_gb: default_max_index_size_gb(),
            max_index_docs: default_max_index_docs(),
            shards: default_shards(),
            replicas: default_replicas(),
            max_total_fields: default_max_total_fields(),
        }
    }
}

fn default_index_prefix() -> String {
    "taskmill".to_string()
}

fn default_max_index_age_days() -> u32 {
    7
}

fn default_max_index_size_gb() -> u32 {
    100
}

fn default_max_index_docs() -> u64 {
    1_000_000_000
}

fn default_shards() -> u32 {
    3
}

fn default_replicas() -> u32 {
    1
}

fn default_max_total_fields() -> u32 {
    4000
}

/// Maintenance schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_memory_retry_interval")]
    pub memory_retry_interval_secs: u64,

    #[serde(default = "default_disk_retry_interval")]
    pub disk_retry_interval_secs: u64,

    #[serde(default = "default_rollover_interval")]
    pub rollover_interval_secs: u64,

    #[serde(default = "default_expiry_interval")]
    pub expiry_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            memory_retry_interval_secs: default_memory_retry_interval(),
            disk_retry_interval_secs: default_disk_retry_interval(),
            rollover_interval_secs: default_rollover_interval(),
            expiry_interval_secs: default_expiry_interval(),
        }
    }
}

fn default_memory_retry_interval() -> u64 {
    10
}

fn default_disk_retry_interval() -> u64 {
    60
}

fn default_rollover_interval() -> u64 {
    600
}

fn default_expiry_interval() -> u64 {
    3600
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// Load configuration from a file path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&text)
    }

    /// Render configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    /// Location of the failure queue database.
    #[must_use]
    pub fn failure_queue_path(&self) -> PathBuf {
        self.persistence
            .path
            .clone()
            .unwrap_or_else(|| self.general.data_dir.join("failed_bulks.db"))
    }

    /// Write alias for the configured environment.
    #[must_use]
    pub fn alias_name(&self) -> String {
        format!("{}-{}", self.lifecycle.index_prefix, self.general.env)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.general.env.trim().is_empty() {
            problems.push("general.env must not be empty".to_string());
        }
        if self.backend.kind == BackendKind::Http && self.backend.url.trim().is_empty() {
            problems.push("backend.url is required for the http backend".to_string());
        }
        if self.backend.search_page_size == 0 {
            problems.push("backend.search_page_size must be > 0".to_string());
        }
        if self.indexing.bulk_max_bytes == 0 {
            problems.push("indexing.bulk_max_bytes must be > 0".to_string());
        }
        if self.indexing.indexing_threads == 0 {
            problems.push("indexing.indexing_threads must be > 0".to_string());
        }
        if self.indexing.retry_queue_capacity == 0 {
            problems.push("indexing.retry_queue_capacity must be > 0".to_string());
        }
        if self.indexing.ttl_days == 0 {
            problems.push("indexing.ttl_days must be > 0".to_string());
        }
        if self.persistence.max_insert_tries == 0 {
            problems.push("persistence.max_insert_tries must be > 0".to_string());
        }
        if self.persistence.max_fetched_bulks_in_one_time == 0 {
            problems.push("persistence.max_fetched_bulks_in_one_time must be > 0".to_string());
        }
        let prefix = &self.lifecycle.index_prefix;
        if prefix.is_empty() || prefix.chars().any(|c| c.is_ascii_uppercase() || c == '*') {
            problems.push(format!(
                "lifecycle.index_prefix {prefix:?} must be non-empty lowercase without wildcards"
            ));
        }
        if self.lifecycle.max_index_age_days == 0
            || self.lifecycle.max_index_size_gb == 0
            || self.lifecycle.max_index_docs == 0
        {
            problems.push("lifecycle rollover thresholds must be > 0".to_string());
        }
        let schedule = &self.schedule;
        if [
            schedule.memory_retry_interval_secs,
            schedule.disk_retry_interval_secs,
            schedule.rollover_interval_secs,
            schedule.expiry_interval_secs,
        ]
        .contains(&0)
        {
            problems.push("schedule intervals must be > 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError(problems.join("; ")).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.indexing.bulk_max_bytes, 2 * 1024 * 1024);
        assert_eq!(config.indexing.indexing_threads, 10);
        assert_eq!(config.persistence.max_fetched_bulks_in_one_time, 100);
        assert_eq!(config.backend.kind, BackendKind::Http);
        assert_eq!(config.alias_name(), "taskmill-default");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [general]
            env = "prod"

            [indexing]
            indexing_threads = 4

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.general.env, "prod");
        assert_eq!(config.indexing.indexing_threads, 4);
        assert_eq!(config.indexing.max_retries, 3);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.alias_name(), "taskmill-prod");
    }

    #[test]
    fn validation_collects_all_problems() {
        let mut config = Config::default();
        config.indexing.indexing_threads = 0;
        config.lifecycle.index_prefix = "Bad*".to_string();
        let err = config.validate().unwrap_err();
        match err {
            Error::Config(ConfigError::ValidationError(msg)) => {
                assert!(msg.contains("indexing_threads"));
                assert!(msg.contains("index_prefix"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parse_error_is_reported() {
        let err = Config::from_toml_str("[indexing\n").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ParseError(_))));
    }

    #[test]
    fn failure_queue_path_defaults_under_data_dir() {
        let mut config = Config::default();
        config.general.data_dir = PathBuf::from("/var/lib/tm");
        assert_eq!(
            config.failure_queue_path(),
            PathBuf::from("/var/lib/tm/failed_bulks.db")
        );
        config.persistence.path = Some(PathBuf::from("/tmp/q.db"));
        assert_eq!(config.failure_queue_path(), PathBuf::from("/tmp/q.db"));
    }

    #[test]
    fn load_from_missing_file() {
        let err = Config::load_from(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut config = Config::default();
        config.general.env = "staging".to_string();
        config.persistence.max_bulk_fetches = 7;
        let text = config.to_toml_string().unwrap();
        let back = Config::from_toml_str(&text).unwrap();
        assert_eq!(back.general.env, "staging");
        assert_eq!(back.persistence.max_bulk_fetches, 7);
    }
}
