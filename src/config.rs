//! Configuration management for the swap engine
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub engine: EngineConfig,
    pub ledger: LedgerConfig,
    pub metrics: MetricsConfig,
    pub cache: CacheConfig,
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub instance_id: String,
    /// Platform fee in minor currency units, charged on top of any
    /// additional payment
    pub platform_fee: i64,
    pub step_timeout_ms: u64,
    pub max_step_retries: u32,
    pub retry_delay_ms: u64,
    pub verify_max_retries: u32,
    pub verify_backoff_ms: u64,
    pub rollback_max_attempts: u32,
    pub rollback_backoff_ms: u64,
    pub execution_retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: "bookswap-local".to_string(),
            platform_fee: 100,
            step_timeout_ms: 30_000,
            max_step_retries: 3,
            retry_delay_ms: 500,
            verify_max_retries: 3,
            verify_backoff_ms: 500,
            rollback_max_attempts: 3,
            rollback_backoff_ms: 250,
            execution_retention_secs: 86_400,
            sweep_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub network: String,
    pub operator_account_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Coalesce invalidation events instead of applying them synchronously
    pub batched: bool,
    pub batch_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    pub slack_webhook_url: Option<String>,
    pub pagerduty_key: Option<String>,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("BOOKSWAP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &PathBuf) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.engine.platform_fee < 0 {
            anyhow::bail!("platform_fee must not be negative");
        }
        if self.engine.step_timeout_ms == 0 {
            anyhow::bail!("step_timeout_ms must be greater than zero");
        }
        if self.engine.rollback_max_attempts == 0 {
            anyhow::bail!("rollback_max_attempts must be at least 1");
        }
        if self.ledger.operator_account_id.is_empty() {
            anyhow::bail!("ledger operator_account_id must be set");
        }
        if self.cache.batched && self.cache.batch_delay_ms == 0 {
            anyhow::bail!("batch_delay_ms must be greater than zero in batched mode");
        }
        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
