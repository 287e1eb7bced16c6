//! HTTP monitoring sink for production error reports.

use crate::error::ClientError;
use async_trait::async_trait;
use opsync_core::{CaptureError, ErrorReport, MonitoringSink};
use std::time::Duration;

/// Posts each [`ErrorReport`] as JSON to a collector endpoint.
pub struct HttpMonitoringSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMonitoringSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl MonitoringSink for HttpMonitoringSink {
    async fn capture(&self, report: ErrorReport) -> Result<(), CaptureError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&report)
            .send()
            .await
            .map_err(|e| CaptureError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(CaptureError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}
