//! # Configuration System
//!
//! Explicit, validated configuration for the orchestration core. All
//! tunables come from a YAML file deserialized into typed sections with
//! serde defaults; credential secrets are supplied through an environment
//! variable so they never live in configuration files.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use analyst_core::config::AnalystConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AnalystConfig::load()?;
//! let workers = config.scheduler.worker_count;
//! let interval = config.throttle.min_interval();
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AnalystError, Result};

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "ANALYST_CONFIG_PATH";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalystConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
}

/// Checkpoint database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Worker pool and recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on concurrent workers; the effective pool size is
    /// `min(worker_count, credential_count)`
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A running job whose heartbeat is older than this is interrupted
    #[serde(default = "default_staleness_threshold_seconds")]
    pub staleness_threshold_seconds: u64,
    /// How long a worker idles before re-checking for a free credential
    #[serde(default = "default_credential_wait_ms")]
    pub credential_wait_ms: u64,
    /// Bounded idle rounds before a worker gives up its claim loop
    #[serde(default = "default_credential_wait_attempts")]
    pub credential_wait_attempts: u32,
}

/// Rate limiting and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two admitted requests, process-wide
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Bounded exponential backoff for retryable failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// Credential pool configuration. Secrets come from the environment
/// variable named here, comma-separated; the inline list exists for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_api_keys_env")]
    pub api_keys_env: String,
    #[serde(default = "default_daily_quota")]
    pub daily_quota: u32,
    /// Offset from UTC, in minutes, of the daily reset wall clock
    #[serde(default = "default_reset_utc_offset_minutes")]
    pub reset_utc_offset_minutes: i32,
}

const fn default_max_connections() -> u32 {
    5
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_database_url() -> String {
    "sqlite://analyst_checkpoint.db".to_string()
}

const fn default_worker_count() -> u32 {
    4
}

const fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

const fn default_staleness_threshold_seconds() -> u64 {
    300
}

const fn default_credential_wait_ms() -> u64 {
    2_000
}

const fn default_credential_wait_attempts() -> u32 {
    30
}

const fn default_min_interval_ms() -> u64 {
    6_000
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    2_000
}

const fn default_max_delay_ms() -> u64 {
    60_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_api_keys_env() -> String {
    "ANALYST_API_KEYS".to_string()
}

const fn default_daily_quota() -> u32 {
    50
}

const fn default_reset_utc_offset_minutes() -> i32 {
    0
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            staleness_threshold_seconds: default_staleness_threshold_seconds(),
            credential_wait_ms: default_credential_wait_ms(),
            credential_wait_attempts: default_credential_wait_attempts(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            api_keys_env: default_api_keys_env(),
            daily_quota: default_daily_quota(),
            reset_utc_offset_minutes: default_reset_utc_offset_minutes(),
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_seconds)
    }

    pub fn credential_wait(&self) -> Duration {
        Duration::from_millis(self.credential_wait_ms)
    }
}

impl ThrottleConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl RetryConfig {
    /// Delay before the given retry attempt (1-based):
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay_ms`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay_ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

impl CredentialConfig {
    /// Resolve credential secrets: the configured environment variable wins,
    /// falling back to the inline list.
    pub fn secrets(&self) -> Result<Vec<String>> {
        let from_env = std::env::var(&self.api_keys_env)
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|keys| !keys.is_empty());

        let secrets = from_env.unwrap_or_else(|| self.api_keys.clone());
        if secrets.is_empty() {
            return Err(AnalystError::ConfigurationError(format!(
                "No credentials configured: set {} or credentials.api_keys",
                self.api_keys_env
            )));
        }
        Ok(secrets)
    }
}

impl AnalystConfig {
    /// Load configuration from the path named by `ANALYST_CONFIG_PATH`, or
    /// fall back to defaults when the variable is unset.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_path(Path::new(&path)),
            Err(_) => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AnalystError::ConfigurationError(format!(
                "Cannot read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AnalystConfig = serde_yaml::from_str(yaml).map_err(|e| {
            AnalystError::ConfigurationError(format!("Invalid config YAML: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work rather than limping along
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.worker_count == 0 {
            return Err(AnalystError::ConfigurationError(
                "scheduler.worker_count must be at least 1".to_string(),
            ));
        }
        if self.throttle.retry.max_attempts == 0 {
            return Err(AnalystError::ConfigurationError(
                "throttle.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.throttle.retry.backoff_multiplier < 1.0 {
            return Err(AnalystError::ConfigurationError(
                "throttle.retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.credentials.daily_quota == 0 {
            return Err(AnalystError::ConfigurationError(
                "credentials.daily_quota must be at least 1".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(AnalystError::ConfigurationError(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AnalystConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.worker_count, 4);
        assert_eq!(config.throttle.min_interval(), Duration::from_secs(6));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = AnalystConfig::from_yaml(
            "scheduler:\n  worker_count: 2\nthrottle:\n  min_interval_ms: 100\n",
        )
        .unwrap();
        assert_eq!(config.scheduler.worker_count, 2);
        assert_eq!(config.throttle.min_interval_ms, 100);
        // Untouched sections keep their defaults
        assert_eq!(config.credentials.daily_quota, 50);
        assert_eq!(config.throttle.retry.max_attempts, 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(AnalystConfig::from_yaml("scheduler:\n  worker_count: 0\n").is_err());
        assert!(AnalystConfig::from_yaml("credentials:\n  daily_quota: 0\n").is_err());
    }

    #[test]
    fn test_backoff_delay_progression() {
        let retry = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        // Capped by max_delay_ms
        assert_eq!(retry.delay_for(3), Duration::from_millis(350));
        assert_eq!(retry.delay_for(10), Duration::from_millis(350));
    }

    #[test]
    fn test_inline_api_keys_fallback() {
        let credentials = CredentialConfig {
            api_keys: vec!["sk-a".to_string(), "sk-b".to_string()],
            api_keys_env: "ANALYST_TEST_KEYS_UNSET".to_string(),
            ..Default::default()
        };
        assert_eq!(credentials.secrets().unwrap().len(), 2);

        let empty = CredentialConfig {
            api_keys_env: "ANALYST_TEST_KEYS_UNSET".to_string(),
            ..Default::default()
        };
        assert!(empty.secrets().is_err());
    }
}
