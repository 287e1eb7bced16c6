//! Structured error reporting.
//!
//! Every surfaced error is logged with `tracing`. In production mode the
//! report is also forwarded to a [`MonitoringSink`]; forwarding is
//! fire-and-forget and can never fail the caller.

use crate::error::{ErrorKind, NormalizedError};
use crate::identity::Timestamp;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Execution mode of the hosting application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Development,
    Production,
}

/// What gets logged and shipped for one failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub context: String,
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorReport {
    pub fn new(error: &NormalizedError, context: impl Into<String>) -> Self {
        Self {
            kind: error.kind,
            message: error.message.clone(),
            context: context.into(),
            timestamp: Utc::now(),
            code: error.meta.code.clone(),
        }
    }
}

/// Why a [`MonitoringSink`] could not deliver a report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("monitoring transport failed: {0}")]
    Transport(String),

    #[error("monitoring endpoint rejected report: HTTP {status}")]
    Rejected { status: u16 },

    #[error("monitoring sink closed")]
    Closed,
}

/// External monitoring destination.
#[async_trait]
pub trait MonitoringSink: Send + Sync {
    /// Deliver one report. Errors are logged by the reporter and dropped.
    async fn capture(&self, report: ErrorReport) -> Result<(), CaptureError>;
}

/// Logs normalized errors and forwards them to monitoring in production.
#[derive(Clone, Default)]
pub struct ErrorReporter {
    mode: ExecutionMode,
    sink: Option<Arc<dyn MonitoringSink>>,
}

impl ErrorReporter {
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode, sink: None }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MonitoringSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Log the error and, in production, ship it. Never fails.
    pub fn report(&self, err: &NormalizedError, context: &str) {
        let report = ErrorReport::new(err, context);

        match err.kind {
            ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::Conflict => warn!(
                kind = %report.kind,
                message = %report.message,
                context = %report.context,
                timestamp = %report.timestamp,
                code = ?report.code,
                "operation failed"
            ),
            _ => error!(
                kind = %report.kind,
                message = %report.message,
                context = %report.context,
                timestamp = %report.timestamp,
                code = ?report.code,
                "operation failed"
            ),
        }

        if self.mode != ExecutionMode::Production {
            return;
        }
        let Some(sink) = self.sink.clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = sink.capture(report).await {
                        debug!(error = %err, "monitoring sink rejected report");
                    }
                });
            }
            Err(_) => debug!("no async runtime, monitoring report dropped"),
        }
    }
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("mode", &self.mode)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<ErrorReport>);

    #[async_trait]
    impl MonitoringSink for ChannelSink {
        async fn capture(&self, report: ErrorReport) -> Result<(), CaptureError> {
            self.0.send(report).map_err(|_| CaptureError::Closed)
        }
    }

    struct FailingSink;

    #[async_trait]
    impl MonitoringSink for FailingSink {
        async fn capture(&self, _report: ErrorReport) -> Result<(), CaptureError> {
            Err(CaptureError::Rejected { status: 503 })
        }
    }

    #[tokio::test]
    async fn test_production_forwards_to_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter =
            ErrorReporter::new(ExecutionMode::Production).with_sink(Arc::new(ChannelSink(tx)));

        reporter.report(&NormalizedError::from_kind(ErrorKind::Permission), "plannings.update");

        let report = rx.recv().await.expect("report forwarded");
        assert_eq!(report.kind, ErrorKind::Permission);
        assert_eq!(report.context, "plannings.update");
    }

    #[tokio::test]
    async fn test_development_does_not_forward() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter =
            ErrorReporter::new(ExecutionMode::Development).with_sink(Arc::new(ChannelSink(tx)));

        reporter.report(&NormalizedError::from_kind(ErrorKind::Network), "plannings.load");
        drop(reporter);

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_failing_sink_never_surfaces() {
        let reporter = ErrorReporter::new(ExecutionMode::Production).with_sink(Arc::new(FailingSink));
        reporter.report(&NormalizedError::from_kind(ErrorKind::Unknown), "inventories.add");
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_capture_error_is_matchable() {
        let sink = FailingSink;
        let report = ErrorReport::new(&NormalizedError::from_kind(ErrorKind::Network), "plannings.load");

        let err = sink.capture(report).await.unwrap_err();
        assert!(matches!(err, CaptureError::Rejected { status: 503 }));
        assert_eq!(err.to_string(), "monitoring endpoint rejected report: HTTP 503");

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let closed = ChannelSink(tx)
            .capture(ErrorReport::new(&NormalizedError::from_kind(ErrorKind::Network), "plannings.load"))
            .await;
        assert_eq!(closed, Err(CaptureError::Closed));
    }

    #[test]
    fn test_report_without_runtime_is_silent() {
        let reporter = ErrorReporter::new(ExecutionMode::Production).with_sink(Arc::new(FailingSink));
        reporter.report(&NormalizedError::from_kind(ErrorKind::Unknown), "inventories.add");
    }
}
