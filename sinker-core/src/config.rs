//! Process configuration. Loaded once at startup from a JSON file, validated,
//! and read-only from then on; each task gets its own immutable [`TaskConfig`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
    pub clickhouse: ClickHouseSettings,
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Bind address of the HTTP endpoint serving `/metrics`.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            http_addr: default_http_addr(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatisticsConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub push_gateway_addrs: Vec<String>,
    #[serde(default = "default_push_interval_secs")]
    pub push_interval_secs: u64,
}

impl StatisticsConfig {
    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseSettings {
    pub url: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ClickHouseSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// One stream source bound to one store target. Immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub brokers: Vec<String>,
    pub topic: String,
    /// Explicit partition assignment; empty means consumer-group balancing.
    #[serde(default)]
    pub partitions: Vec<i32>,
    pub consumer_group: String,
    /// Extra librdkafka options passed through verbatim.
    #[serde(default)]
    pub kafka_raw_config: HashMap<String, String>,
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// What to do with a batch once the store writer has exhausted its retry
    /// budget.
    #[serde(default)]
    pub on_write_failure: WriteFailureStrategy,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl TaskConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Resolution policy for a terminal write failure. `Drop` loses the batch but
/// keeps the partition moving; `Retry` keeps the batch intact and retries in
/// subsequent windows, at the price of a stalled partition while the store is
/// down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteFailureStrategy {
    #[default]
    Drop,
    Retry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u16,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_cap_delay_ms")]
    pub cap_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            cap_delay_ms: default_cap_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    /// Target column name.
    pub name: String,
    /// Field in the record payload; defaults to the column name.
    #[serde(default)]
    pub source: Option<String>,
    pub kind: ColumnKind,
    #[serde(default)]
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn source_field(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Int64,
    Uint64,
    Float64,
    String,
    Bool,
    Datetime,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            Error::Config(format!(
                "Reading config file {}: {err}",
                path.as_ref().display()
            ))
        })?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|err| Error::Config(format!("Parsing config file: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::Config("At least one task is required".into()));
        }
        let mut names = std::collections::HashSet::new();
        for task in &self.tasks {
            if !names.insert(task.name.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate task name: {}",
                    task.name
                )));
            }
            if task.brokers.is_empty() {
                return Err(Error::Config(format!(
                    "Task {} has no brokers",
                    task.name
                )));
            }
            if task.columns.is_empty() {
                return Err(Error::Config(format!(
                    "Task {} has no column mapping",
                    task.name
                )));
            }
            if task.batch_size == 0 {
                return Err(Error::Config(format!(
                    "Task {} has a zero batch size",
                    task.name
                )));
            }
            if task.retry.max_attempts == 0 {
                return Err(Error::Config(format!(
                    "Task {} has a zero retry budget",
                    task.name
                )));
            }
        }
        if self.statistics.enable && self.statistics.push_gateway_addrs.is_empty() {
            return Err(Error::Config(
                "Statistics push enabled but no push gateway addresses given".into(),
            ));
        }
        Ok(())
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:2112".to_string()
}

fn default_push_interval_secs() -> u64 {
    10
}

fn default_database() -> String {
    "default".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    10_000
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u16 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_cap_delay_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn minimal_config_json() -> &'static str {
        r#"{
            "clickhouse": { "url": "http://localhost:8123" },
            "tasks": [
                {
                    "name": "events",
                    "brokers": ["localhost:9092"],
                    "topic": "events",
                    "consumer_group": "sinker",
                    "table": "events",
                    "columns": [
                        { "name": "ts", "kind": "datetime" },
                        { "name": "level", "kind": "string" },
                        { "name": "count", "kind": "uint64", "nullable": true }
                    ]
                }
            ]
        }"#
    }

    #[test]
    fn defaults_are_applied() {
        let config: Config = serde_json::from_str(minimal_config_json()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.metrics.http_addr, "0.0.0.0:2112");
        assert!(!config.statistics.enable);
        assert_eq!(config.clickhouse.database, "default");
        let task = &config.tasks[0];
        assert_eq!(task.batch_size, 10_000);
        assert_eq!(task.flush_interval(), Duration::from_secs(10));
        assert_eq!(task.poll_timeout(), Duration::from_millis(1_000));
        assert_eq!(task.on_write_failure, WriteFailureStrategy::Drop);
        assert_eq!(task.retry.max_attempts, 3);
        assert_eq!(task.retry.base_delay_ms, 500);
        assert_eq!(task.columns[2].source_field(), "count");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal_config_json().as_bytes()).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.tasks.len(), 1);
        assert_eq!(config.tasks[0].name, "events");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Config::from_file("/nonexistent/sinker.json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_duplicate_task_names() {
        let mut config: Config = serde_json::from_str(minimal_config_json()).unwrap();
        let duplicate = config.tasks[0].clone();
        config.tasks.push(duplicate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_push_without_addresses() {
        let mut config: Config = serde_json::from_str(minimal_config_json()).unwrap();
        config.statistics.enable = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_tasks() {
        let mut config: Config = serde_json::from_str(minimal_config_json()).unwrap();
        config.tasks.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_write_failure_strategy() {
        let raw = r#"{ "name": "t", "brokers": ["b"], "topic": "t", "consumer_group": "g",
                       "table": "t", "columns": [{ "name": "a", "kind": "string" }],
                       "on_write_failure": "retry" }"#;
        let task: TaskConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(task.on_write_failure, WriteFailureStrategy::Retry);
    }
}
