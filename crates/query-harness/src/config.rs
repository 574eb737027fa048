//! Process configuration, loaded from a single TOML file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub result_store: ResultStoreConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            prefetch: default_prefetch(),
        }
    }
}

fn default_broker_url() -> String {
    "amqp://127.0.0.1:5672/%2f".to_string()
}

fn default_prefetch() -> u16 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultStoreConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
}

impl Default for ResultStoreConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            result_ttl_secs: default_result_ttl_secs(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_result_ttl_secs() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_db_path")]
    pub db_path: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            db_path: default_metadata_db_path(),
        }
    }
}

fn default_metadata_db_path() -> String {
    "articles.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_await_timeout_secs")]
    pub await_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            await_timeout_secs: default_await_timeout_secs(),
        }
    }
}

fn default_await_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    #[serde(default = "default_max_results")]
    pub max_results_default: i64,
    #[serde(default = "default_max_results_cap")]
    pub max_results_cap: i64,
    #[serde(default = "default_score_threshold")]
    pub score_threshold_default: f64,
    #[serde(default = "default_immediate_budget_secs")]
    pub immediate_budget_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_results_default: default_max_results(),
            max_results_cap: default_max_results_cap(),
            score_threshold_default: default_score_threshold(),
            immediate_budget_secs: default_immediate_budget_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_max_results() -> i64 {
    10
}

fn default_max_results_cap() -> i64 {
    50
}

fn default_score_threshold() -> f64 {
    0.7
}

fn default_immediate_budget_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            result_store: ResultStoreConfig::default(),
            metadata: MetadataConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            intake: IntakeConfig::default(),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.orchestrator.await_timeout_secs == 0 {
            bail!("orchestrator.await_timeout_secs must be > 0");
        }
        if self.result_store.result_ttl_secs == 0 {
            bail!("result_store.result_ttl_secs must be > 0");
        }
        if self.intake.max_results_cap < 1 {
            bail!("intake.max_results_cap must be >= 1");
        }
        if self.intake.max_results_default < 1 || self.intake.max_results_default > self.intake.max_results_cap {
            bail!("intake.max_results_default must be in [1, max_results_cap]");
        }
        if !(0.0..=1.0).contains(&self.intake.score_threshold_default) {
            bail!("intake.score_threshold_default must be in [0.0, 1.0]");
        }
        if self.broker.prefetch == 0 {
            bail!("broker.prefetch must be > 0");
        }
        Ok(())
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
