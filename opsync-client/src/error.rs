//! Error types for client setup.

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: &'static str, reason: String },
    #[error("Failed to initialize logging: {0}")]
    Telemetry(String),
}
