use config::{Config, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use validator::{Validate, ValidationError};

use crate::db::transaction::RetryPolicy;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_DATABASE_URL: &str = "sqlite://procurement.db?mode=rwc";
const DEFAULT_CONFLICT_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_CONFLICT_RETRY_BACKOFF_MS: u64 = 25;
const DEFAULT_DELIVERY_FALLBACK_DAYS: i64 = 14;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Configuration for the procurement core
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ProcurementConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1, max = 500))]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Attempts made on an aggregate before an optimistic-concurrency conflict is surfaced
    #[serde(default = "default_conflict_retry_attempts")]
    #[validate(range(min = 1, max = 50))]
    pub conflict_retry_attempts: u32,

    /// Linear backoff step between conflict retries, in milliseconds
    #[serde(default = "default_conflict_retry_backoff_ms")]
    #[validate(range(max = 10000))]
    pub conflict_retry_backoff_ms: u64,

    /// Days added to the award date when no accepted offer carries a delivery estimate
    #[serde(default = "default_delivery_fallback_days")]
    #[validate(range(min = 1, max = 365))]
    pub default_delivery_fallback_days: i64,

    /// Capacity of the domain event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for ProcurementConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
            conflict_retry_attempts: default_conflict_retry_attempts(),
            conflict_retry_backoff_ms: default_conflict_retry_backoff_ms(),
            default_delivery_fallback_days: default_delivery_fallback_days(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl ProcurementConfig {
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Retry policy applied to every optimistic aggregate transaction.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.conflict_retry_attempts,
            backoff: Duration::from_millis(self.conflict_retry_backoff_ms),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("db_min_connections ({min}) exceeds db_max_connections ({max})")]
    PoolBounds { min: u32, max: u32 },
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_min_connections() -> u32 {
    1
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_conflict_retry_attempts() -> u32 {
    DEFAULT_CONFLICT_RETRY_ATTEMPTS
}

fn default_conflict_retry_backoff_ms() -> u64 {
    DEFAULT_CONFLICT_RETRY_BACKOFF_MS
}

fn default_delivery_fallback_days() -> i64 {
    DEFAULT_DELIVERY_FALLBACK_DAYS
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Validates a loaded configuration, including cross-field rules.
pub fn validate_config(config: &ProcurementConfig) -> Result<(), ConfigError> {
    config.validate()?;
    if config.db_min_connections > config.db_max_connections {
        return Err(ConfigError::PoolBounds {
            min: config.db_min_connections,
            max: config.db_max_connections,
        });
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("stateset_procurement={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads the procurement configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<ProcurementConfig, ConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", DEFAULT_DATABASE_URL)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let procurement: ProcurementConfig = config.try_deserialize()?;
    validate_config(&procurement)?;
    Ok(procurement)
}
