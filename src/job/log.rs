//! Append-only job log, mirrored to tracing and the live channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::live::{JobEvent, LiveChannel};
use crate::store::JobStore;

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Success,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warning" => Self::Warning,
            "error" => Self::Error,
            "success" => Self::Success,
            "critical" => Self::Critical,
            other => return Err(format!("unknown log level: {other}")),
        })
    }
}

/// One entry of a job's log. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub step: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(
        job_id: Uuid,
        level: LogLevel,
        step: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            timestamp: Utc::now(),
            level,
            step: step.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Log sink bound to one job.
#[derive(Clone)]
pub struct JobLog {
    job_id: Uuid,
    store: Arc<dyn JobStore>,
    live: LiveChannel,
}

impl JobLog {
    pub fn new(job_id: Uuid, store: Arc<dyn JobStore>, live: LiveChannel) -> Self {
        Self {
            job_id,
            store,
            live,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Append an entry. Persistence and live delivery are best-effort:
    /// failures are reported through tracing and never reach the caller.
    pub async fn write(
        &self,
        level: LogLevel,
        step: &str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        let mut entry = LogEntry::new(self.job_id, level, step, message);
        entry.details = details;

        mirror_to_tracing(&entry);

        if let Err(e) = self.store.append_log(&entry).await {
            tracing::warn!(job_id = %self.job_id, error = %e, "Failed to persist job log entry");
        }

        self.live.publish(JobEvent::Log { entry });
    }

    pub async fn info(&self, step: &str, message: impl Into<String>) {
        self.write(LogLevel::Info, step, message, None).await;
    }

    pub async fn warning(&self, step: &str, message: impl Into<String>) {
        self.write(LogLevel::Warning, step, message, None).await;
    }

    pub async fn critical(&self, step: &str, message: impl Into<String>, details: serde_json::Value) {
        self.write(LogLevel::Critical, step, message, Some(details))
            .await;
    }
}

fn mirror_to_tracing(entry: &LogEntry) {
    let job_id = entry.job_id;
    let step = entry.step.as_str();
    let message = entry.message.as_str();
    match entry.level {
        LogLevel::Debug => tracing::debug!(job_id = %job_id, step, "{message}"),
        LogLevel::Info | LogLevel::Success => tracing::info!(job_id = %job_id, step, "{message}"),
        LogLevel::Warning => tracing::warn!(job_id = %job_id, step, "{message}"),
        LogLevel::Error | LogLevel::Critical => {
            tracing::error!(job_id = %job_id, step, level = entry.level.as_str(), "{message}")
        }
    }
}
