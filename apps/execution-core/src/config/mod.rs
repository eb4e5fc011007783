//! Configuration loading for the execution core.
//!
//! YAML file with `${VAR}` environment interpolation; every field carries
//! a serde default so a partial file (or none at all) yields a runnable
//! paper-mode configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::TradingMode;
use crate::protections::ProtectionsConfig;
use crate::reconcile::ReconcilerConfig;
use crate::risk::RiskConfig;
use crate::runtime::RuntimeConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Path to the config file.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse the YAML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml_bw::Error),

    /// Semantic validation failed.
    #[error("config validation failed: {0}")]
    Validation(String),
}

/// Account section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Paper or live.
    #[serde(default)]
    pub mode: TradingMode,
}

/// Execution section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// TTL applied to resting LIMIT orders that carry none of their own.
    #[serde(default = "default_limit_ttl_seconds")]
    pub default_limit_ttl_seconds: u64,
    /// Path of the transaction journal.
    #[serde(default = "default_journal_path")]
    pub journal_path: String,
    /// Path of the position database.
    #[serde(default = "default_positions_db_path")]
    pub positions_db_path: String,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_limit_ttl_seconds: default_limit_ttl_seconds(),
            journal_path: default_journal_path(),
            positions_db_path: default_positions_db_path(),
        }
    }
}

const fn default_limit_ttl_seconds() -> u64 {
    90
}

fn default_journal_path() -> String {
    "data/journal.jsonl".to_string()
}

fn default_positions_db_path() -> String {
    "data/positions.db".to_string()
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Account settings.
    #[serde(default)]
    pub account: AccountConfig,
    /// Pre-trade risk limits.
    #[serde(default)]
    pub risk: RiskConfig,
    /// Protection circuit breakers.
    #[serde(default)]
    pub protections: ProtectionsConfig,
    /// Reconciliation thresholds.
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    /// Trading loop settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Engine settings.
    #[serde(default)]
    pub execution: ExecutionSettings,
}

/// Load configuration from a YAML file with `${VAR}` interpolation.
pub fn load_config(path: Option<&str>) -> Result<ExecutionConfig, ConfigError> {
    let path = path.unwrap_or("config.yaml");
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_string(),
        source: e,
    })?;
    parse_config(&contents)
}

/// Parse configuration from a YAML string.
pub fn parse_config(contents: &str) -> Result<ExecutionConfig, ConfigError> {
    let interpolated = interpolate_env_vars(contents);
    let config: ExecutionConfig = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &ExecutionConfig) -> Result<(), ConfigError> {
    if config.runtime.cycle_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "runtime.cycle_interval_secs must be positive".to_string(),
        ));
    }
    if config.runtime.max_consecutive_failures == 0 {
        return Err(ConfigError::Validation(
            "runtime.max_consecutive_failures must be positive".to_string(),
        ));
    }
    if config.reconciler.max_drift_pct < rust_decimal::Decimal::ZERO {
        return Err(ConfigError::Validation(
            "reconciler.max_drift_pct must not be negative".to_string(),
        ));
    }
    if config.risk.daily_loss_limit <= rust_decimal::Decimal::ZERO {
        return Err(ConfigError::Validation(
            "risk.daily_loss_limit must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Replace `${VAR}` occurrences with the environment value; unknown
/// variables are left untouched so parsing surfaces them.
fn interpolate_env_vars(contents: &str) -> String {
    let mut result = String::with_capacity(contents.len());
    let mut rest = contents;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}
