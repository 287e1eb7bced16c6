//! OPSYNC Client - network transports and process setup.
//!
//! Wires entity stores to a PostgREST-style HTTP backend and a WebSocket
//! change feed, and loads the TOML configuration that drives them.

pub mod config;
pub mod connectivity;
pub mod error;
pub mod monitor;
pub mod rest;
pub mod telemetry;
pub mod ws;

pub use config::{AuthConfig, ConfigError, LoggingConfig, ReconnectConfig, SyncConfig};
pub use connectivity::Connectivity;
pub use error::ClientError;
pub use monitor::HttpMonitoringSink;
pub use rest::RestCollection;
pub use ws::WsFeedSource;

use opsync_core::ErrorReporter;
use std::sync::Arc;

/// Reporter for the configured mode, shipping to the monitoring endpoint
/// when one is set.
pub fn build_reporter(config: &SyncConfig) -> Result<ErrorReporter, ClientError> {
    let reporter = ErrorReporter::new(config.mode);
    match &config.monitoring_endpoint {
        Some(endpoint) => {
            let sink = HttpMonitoringSink::new(endpoint.clone(), config.request_timeout())?;
            Ok(reporter.with_sink(Arc::new(sink)))
        }
        None => Ok(reporter),
    }
}
