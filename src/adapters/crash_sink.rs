use async_trait::async_trait;
use tracing::{error, warn};

use crate::error::DispatchError;

/// Severity the crash sink files a report at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[async_trait]
pub trait CrashSink: Send + Sync {
    async fn report(&self, severity: Severity, message: &str);
}

/// Routes an error to the crash sink the way the fleet's entrypoints always
/// have: an I/O error is a warning (the edge server is probably just down),
/// everything else is an error.
pub async fn report_error(sink: &dyn CrashSink, err: &DispatchError) {
    match err {
        DispatchError::Io(_) | DispatchError::Transport { .. } => {
            sink.report(Severity::Warning, &err.to_string()).await;
        }
        other => sink.report(Severity::Error, &other.to_string()).await,
    }
}

/// No-op sink for local/dev runs with no `ROLLBAR_TOKEN` configured: logs
/// at the matching `tracing` level instead of phoning home.
pub struct LoggingCrashSink;

#[async_trait]
impl CrashSink for LoggingCrashSink {
    async fn report(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Warning => warn!(%message, "crash sink (logging-only)"),
            Severity::Error => error!(%message, "crash sink (logging-only)"),
        }
    }
}

/// Posts crash reports to a Rollbar-compatible ingestion endpoint.
pub struct RollbarSink {
    client: reqwest::Client,
    token: String,
    environment: String,
}

impl RollbarSink {
    pub fn new(token: String, environment: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            environment,
        }
    }
}

#[async_trait]
impl CrashSink for RollbarSink {
    async fn report(&self, severity: Severity, message: &str) {
        let level = match severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };

        let payload = serde_json::json!({
            "access_token": self.token,
            "data": {
                "environment": self.environment,
                "level": level,
                "body": { "message": { "body": message } },
            }
        });

        if let Err(err) = self
            .client
            .post("https://api.rollbar.com/api/1/item/")
            .json(&payload)
            .send()
            .await
        {
            error!(error = %err, "failed to report crash to rollbar");
        }
    }
}
