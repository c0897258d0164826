//! Per-run environment and the per-step context handed to [`Step::run`].
//!
//! [`Step::run`]: crate::steps::Step::run

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{RegistryError, StepError};
use crate::job::log::{JobLog, LogLevel};
use crate::job::progress::SubtaskProgress;
use crate::job::state::{StepProgress, percent};
use crate::job::CancellationToken;
use crate::live::{JobEvent, LiveChannel};
use crate::pipeline::registry::{StepDescriptor, StepParams};
use crate::registry::RegistryClient;
use crate::steps::RunArtifacts;
use crate::store::{CatalogSink, JobStore};

/// Handles shared by every step of one run.
#[derive(Clone)]
pub struct RunEnv {
    pub job_id: Uuid,
    pub store: Arc<dyn JobStore>,
    pub catalog: Arc<dyn CatalogSink>,
    pub client: Option<Arc<dyn RegistryClient>>,
    pub live: LiveChannel,
    pub log: JobLog,
    pub cancel: CancellationToken,
    /// Minimum time between two persisted subtask progress writes.
    pub progress_interval: Duration,
}

impl RunEnv {
    pub fn new(
        job_id: Uuid,
        store: Arc<dyn JobStore>,
        catalog: Arc<dyn CatalogSink>,
        client: Option<Arc<dyn RegistryClient>>,
        live: LiveChannel,
        progress_interval: Duration,
    ) -> Self {
        Self {
            job_id,
            log: JobLog::new(job_id, Arc::clone(&store), live.clone()),
            cancel: CancellationToken::new(job_id, Arc::clone(&store)),
            store,
            catalog,
            client,
            live,
            progress_interval,
        }
    }
}

/// What a step sees while it runs.
pub struct StepContext {
    env: RunEnv,
    descriptor: StepDescriptor,
    artifacts: RunArtifacts,
    errors: Vec<String>,
    processed: u64,
}

impl StepContext {
    pub fn new(env: RunEnv, descriptor: StepDescriptor, artifacts: RunArtifacts) -> Self {
        Self {
            env,
            descriptor,
            artifacts,
            errors: Vec::new(),
            processed: 0,
        }
    }

    /// Hand the artifacts back to the orchestrator for the next step.
    pub fn into_artifacts(self) -> RunArtifacts {
        self.artifacts
    }

    pub fn job_id(&self) -> Uuid {
        self.env.job_id
    }

    pub fn env(&self) -> &RunEnv {
        &self.env
    }

    pub fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    pub fn params(&self) -> &StepParams {
        &self.descriptor.params
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogSink> {
        &self.env.catalog
    }

    pub fn artifacts(&self) -> &RunArtifacts {
        &self.artifacts
    }

    pub fn artifacts_mut(&mut self) -> &mut RunArtifacts {
        &mut self.artifacts
    }

    /// Non-fatal errors recorded so far.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Units of work processed so far, as last reported.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// The registry client, or `NotConfigured` when the run has none.
    pub fn client(&self) -> Result<Arc<dyn RegistryClient>, StepError> {
        self.env
            .client
            .clone()
            .ok_or(StepError::Registry(RegistryError::NotConfigured))
    }

    pub fn has_client(&self) -> bool {
        self.env.client.is_some()
    }

    // ── Progress ────────────────────────────────────────────────────

    /// Report `current` of `total` for this step. Returns the percentage.
    pub async fn update_progress(
        &mut self,
        current: u64,
        total: u64,
        message: &str,
    ) -> Result<u8, StepError> {
        let pct = percent(current, total);
        self.processed = current;

        let store = &self.env.store;
        store
            .update_progress(self.env.job_id, self.descriptor.label(), pct, None)
            .await?;
        store
            .record_step_progress(
                self.env.job_id,
                self.descriptor.name(),
                &StepProgress {
                    processed: current,
                    total,
                    progress: pct,
                    message: message.to_string(),
                    errors: self.errors.len(),
                },
            )
            .await?;

        self.env.live.publish(JobEvent::Progress {
            job_id: self.env.job_id,
            step: self.descriptor.name().to_string(),
            percent: pct,
        });
        Ok(pct)
    }

    /// Throttled reporter for one inner loop. Call `clear()` when done.
    pub fn create_subtask_progress(&self, name: &str) -> SubtaskProgress {
        SubtaskProgress::new(
            self.env.job_id,
            name,
            Arc::clone(&self.env.store),
            self.env.live.clone(),
            self.env.progress_interval,
        )
    }

    // ── Cancellation ────────────────────────────────────────────────

    pub async fn check_cancelled(&self) -> bool {
        self.env.cancel.is_cancelled().await
    }

    pub async fn raise_if_cancelled(&self) -> Result<(), StepError> {
        if self.check_cancelled().await {
            return Err(StepError::Cancelled);
        }
        Ok(())
    }

    // ── Errors and logging ──────────────────────────────────────────

    pub async fn log(&self, level: LogLevel, message: impl Into<String>, details: Option<serde_json::Value>) {
        self.env
            .log
            .write(level, self.descriptor.label(), message, details)
            .await;
    }

    /// Record a non-fatal error and keep going.
    pub async fn handle_error(&mut self, error: impl std::fmt::Display, context: &str) {
        let message = format!("{context}: {error}");
        self.errors.push(message.clone());
        self.log(
            LogLevel::Error,
            message,
            Some(serde_json::json!({
                "context": context,
                "error": error.to_string(),
            })),
        )
        .await;
    }

    /// Authorization-class registry errors stop the step; anything else is
    /// recorded through [`handle_error`](Self::handle_error).
    pub async fn handle_registry_error(
        &mut self,
        error: RegistryError,
        context: &str,
    ) -> Result<(), StepError> {
        if error.is_authorization() {
            self.log(
                LogLevel::Critical,
                format!("{context}: registry access denied: {}", error.user_message()),
                Some(serde_json::json!({
                    "context": context,
                    "error": error.to_string(),
                })),
            )
            .await;
            return Err(StepError::Registry(error));
        }
        self.handle_error(error.user_message(), context).await;
        Ok(())
    }
}
