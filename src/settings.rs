use serde::Deserialize;

use crate::config::IdempotencyConfig;
use crate::observability::logging::{LogConfig, LogFormat};

/// File/environment configuration for applications embedding the crate.
/// Sources: `config/default`, optional `config/local`, then `APP__`-prefixed
/// environment variables.
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub idempotency: IdempotencySettings,
    pub application: ApplicationSettings,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct IdempotencySettings {
    #[serde(default = "default_ttl_seconds")]
    pub expires_after_seconds: i64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub use_local_cache: bool,
    #[serde(default = "default_cache_size")]
    pub max_local_cache_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub throw_on_no_idempotency_key: bool,
}

fn default_ttl_seconds() -> i64 {
    3600
}

fn default_key_prefix() -> String {
    "idempotency".to_string()
}

fn default_cache_size() -> usize {
    256
}

fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize)]
pub struct ApplicationSettings {
    pub log_level: String,
    #[serde(default)]
    pub log_format: Option<String>,
}

impl ApplicationSettings {
    /// Builds a [`LogConfig`] for [`crate::observability::init_logging`] from
    /// the application section. An absent format falls back to pretty output.
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self
                .log_format
                .as_deref()
                .map(LogFormat::from)
                .unwrap_or(LogFormat::Pretty),
            ..LogConfig::default()
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}

impl IdempotencySettings {
    /// Builds an [`IdempotencyConfig`] carrying these operational defaults.
    /// Extractors and hash overrides are code-level concerns and stay on the
    /// builder.
    pub fn to_config(&self) -> IdempotencyConfig {
        IdempotencyConfig::default()
            .with_expires_after_seconds(self.expires_after_seconds)
            .with_key_prefix(self.key_prefix.clone())
            .with_local_cache(self.use_local_cache)
            .with_max_local_cache_size(self.max_local_cache_size)
            .with_max_retries(self.max_retries)
            .with_throw_on_no_idempotency_key(self.throw_on_no_idempotency_key)
    }
}
