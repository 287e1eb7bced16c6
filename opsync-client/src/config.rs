//! Configuration loading for opsync clients.
//!
//! All fields are required unless explicitly marked optional. No defaults.

use opsync_core::ExecutionMode;
use opsync_store::StoreConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "OPSYNC_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub ws_endpoint: String,
    pub collection: String,
    pub partition_key: String,
    pub auth: AuthConfig,
    pub mode: ExecutionMode,
    /// Where production error reports are shipped.
    pub monitoring_endpoint: Option<String>,
    pub request_timeout_ms: u64,
    /// Zero disables cache adoption on load.
    pub cache_ttl_ms: u64,
    pub echo_grace_ms: u64,
    pub feed_buffer: usize,
    pub logging: LoggingConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub jwt: Option<String>,
}

impl AuthConfig {
    /// Header name/value pairs every remote call carries.
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(api_key) = &self.api_key {
            pairs.push(("apikey", api_key.clone()));
        }
        // The anon key doubles as bearer when no session token is configured.
        if let Some(token) = self.jwt.as_ref().or(self.api_key.as_ref()) {
            pairs.push(("authorization", format!("Bearer {}", token)));
        }
        pairs
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or OPSYNC_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

impl SyncConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !has_scheme(&self.api_base_url, &["http://", "https://"]) {
            return Err(ConfigError::invalid("api_base_url", "must be an http(s) URL"));
        }
        if !has_scheme(&self.ws_endpoint, &["ws://", "wss://"]) {
            return Err(ConfigError::invalid("ws_endpoint", "must be a ws(s) URL"));
        }
        if self.collection.trim().is_empty() {
            return Err(ConfigError::invalid("collection", "must not be empty"));
        }
        if self.partition_key.trim().is_empty() {
            return Err(ConfigError::invalid("partition_key", "must not be empty"));
        }
        if self.auth.api_key.is_none() && self.auth.jwt.is_none() {
            return Err(ConfigError::invalid("auth", "api_key or jwt must be provided"));
        }
        if let Some(endpoint) = &self.monitoring_endpoint {
            if !has_scheme(endpoint, &["http://", "https://"]) {
                return Err(ConfigError::invalid(
                    "monitoring_endpoint",
                    "must be an http(s) URL",
                ));
            }
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("request_timeout_ms", "must be > 0"));
        }
        if self.echo_grace_ms == 0 {
            return Err(ConfigError::invalid("echo_grace_ms", "must be > 0"));
        }
        if self.feed_buffer == 0 {
            return Err(ConfigError::invalid("feed_buffer", "must be > 0"));
        }
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::invalid("logging.filter", "must not be empty"));
        }
        if self.reconnect.initial_ms == 0 {
            return Err(ConfigError::invalid("reconnect.initial_ms", "must be > 0"));
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ConfigError::invalid("reconnect.max_ms", "must be >= initial_ms"));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::invalid("reconnect.multiplier", "must be >= 1.0"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Store tuning derived from this file.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new()
            .with_cache_ttl(Duration::from_millis(self.cache_ttl_ms))
            .with_echo_grace(Duration::from_millis(self.echo_grace_ms))
            .with_request_timeout(self.request_timeout())
            .with_feed_buffer(self.feed_buffer)
    }
}

fn has_scheme(url: &str, schemes: &[&str]) -> bool {
    let url = url.trim();
    schemes
        .iter()
        .any(|scheme| url.len() > scheme.len() && url.starts_with(scheme))
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
