//! Orchestrator — runs the enabled steps of one job in order.
//!
//! Flow:
//! 1. Resolve enabled steps from the typed registry
//! 2. Pre-flight registry probe (may abort or degrade the run)
//! 3. Execute steps, honouring pause and cancel at step boundaries
//! 4. Finalize hooks, then the terminal status
//!
//! Failure policy: a failing required step or any authorization-class
//! error stops the run and fails it. Optional step failures are recorded
//! against the step and the run carries on.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ImportConfig, PipelineSettings};
use crate::error::{DatabaseError, Error, JobError};
use crate::job::cancel::Checkpoint;
use crate::job::log::LogLevel;
use crate::job::state::{JobStatus, StepStatistics};
use crate::live::JobEvent;
use crate::pipeline::hooks::{FinalizeHook, default_hooks};
use crate::pipeline::registry::{StepDescriptor, build_step, resolve_steps};
use crate::registry::{ProbeOutcome, probe_client};
use crate::steps::{RunArtifacts, RunEnv, Step, StepContext, StepOutput, execute};
use crate::store::JobStore;

/// Step label used for run-level log entries.
const PIPELINE_STEP: &str = "Pipeline";

/// Builds the implementation of a resolved step.
pub type StepFactory = Arc<dyn Fn(&StepDescriptor) -> Box<dyn Step> + Send + Sync>;

/// How one step settled.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepResult {
    Completed(StepOutput),
    Failed { error: String, critical: bool },
    Skipped { reason: String },
}

impl StepResult {
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// Result of one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub status: JobStatus,
    /// Keyed by step name; only steps that were reached appear.
    pub results: BTreeMap<String, StepResult>,
    /// First pipeline-fatal error, if any.
    pub critical_error: Option<String>,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Administrative status flips for one job.
#[derive(Clone)]
pub struct RunControl {
    job_id: Uuid,
    store: Arc<dyn JobStore>,
}

impl RunControl {
    pub fn new(job_id: Uuid, store: Arc<dyn JobStore>) -> Self {
        Self { job_id, store }
    }

    /// Hold the run at the next step boundary.
    pub async fn pause(&self) -> Result<(), Error> {
        self.transition(JobStatus::Paused).await
    }

    pub async fn resume(&self) -> Result<(), Error> {
        self.transition(JobStatus::Running).await
    }

    /// Request cancellation. Steps observe it at their next checkpoint.
    pub async fn cancel(&self) -> Result<(), Error> {
        if self.store.mark_cancelled(self.job_id).await? {
            info!(job_id = %self.job_id, "Cancellation requested");
            return Ok(());
        }
        Err(self.rejected(JobStatus::Cancelled).await)
    }

    async fn transition(&self, target: JobStatus) -> Result<(), Error> {
        if self.store.set_status(self.job_id, target).await? {
            info!(job_id = %self.job_id, status = target.as_str(), "Job status changed");
            return Ok(());
        }
        Err(self.rejected(target).await)
    }

    async fn rejected(&self, target: JobStatus) -> Error {
        match self.store.get_status(self.job_id).await {
            Ok(Some(state)) => JobError::InvalidTransition {
                id: self.job_id,
                state: state.as_str().to_string(),
                target: target.as_str().to_string(),
            }
            .into(),
            Ok(None) => JobError::NotFound { id: self.job_id }.into(),
            Err(e) => e.into(),
        }
    }
}

/// Executes the pipeline for one job record.
pub struct Orchestrator {
    env: RunEnv,
    config: ImportConfig,
    settings: PipelineSettings,
    descriptors: Vec<StepDescriptor>,
    hooks: Vec<Box<dyn FinalizeHook>>,
    factory: StepFactory,
}

impl Orchestrator {
    pub fn new(env: RunEnv, config: ImportConfig, settings: PipelineSettings) -> Self {
        let descriptors = resolve_steps(&config);
        Self {
            env,
            config,
            settings,
            descriptors,
            hooks: default_hooks(),
            factory: Arc::new(build_step),
        }
    }

    /// Replace the built-in step implementations.
    pub fn with_step_factory(mut self, factory: StepFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn control(&self) -> RunControl {
        RunControl::new(self.env.job_id, Arc::clone(&self.env.store))
    }

    /// Run every enabled step and settle the job record.
    pub async fn run(self) -> Result<PipelineOutcome, Error> {
        let job_id = self.env.job_id;
        let total = self.descriptors.len() as u32;
        let mut results = BTreeMap::new();

        // ── Pre-flight ──────────────────────────────────────────────
        let needs_registry = self
            .descriptors
            .iter()
            .any(|d| d.kind.requires_registry());
        let probe = probe_client(self.env.client.as_deref()).await;
        let mut skip_remote = false;

        if needs_registry && !probe.is_authorized() {
            match &probe {
                ProbeOutcome::Unavailable(reason) if self.config.skip_unreachable_steps => {
                    self.env
                        .log
                        .warning(
                            "Authorization check",
                            format!("Registry unavailable, registry-dependent steps will be skipped: {reason}"),
                        )
                        .await;
                    skip_remote = true;
                }
                _ => {
                    let reason = probe.message().unwrap_or("registry check failed").to_string();
                    let message = format!("Registry authorization check failed: {reason}");
                    self.env
                        .log
                        .critical(
                            "Authorization check",
                            message.clone(),
                            serde_json::json!({
                                "forbidden": matches!(probe, ProbeOutcome::Forbidden(_)),
                                "reason": reason,
                            }),
                        )
                        .await;
                    self.env.store.mark_failed(job_id, &message, &reason).await?;
                    return self.settle(results, Some(message)).await;
                }
            }
        }

        if !self.env.store.mark_running(job_id, total).await? {
            warn!(job_id = %job_id, "Job is no longer startable");
            return self.settle(results, None).await;
        }
        self.env.live.publish(JobEvent::Started {
            job_id,
            total_steps: total,
            steps: self.descriptors.iter().map(|d| d.name().to_string()).collect(),
        });
        info!(job_id = %job_id, total_steps = total, "Pipeline started");

        // ── Steps ───────────────────────────────────────────────────
        let mut artifacts = RunArtifacts::default();
        let mut critical_error = None;
        let mut cancelled = false;

        for (index, descriptor) in self.descriptors.iter().enumerate() {
            if self.wait_at_boundary(descriptor).await? == Checkpoint::Cancelled {
                self.env
                    .log
                    .warning(PIPELINE_STEP, format!("Import cancelled before {}", descriptor.label()))
                    .await;
                cancelled = true;
                break;
            }

            self.env
                .store
                .update_progress(job_id, descriptor.label(), 0, Some(index as u32))
                .await?;
            self.env.live.publish(JobEvent::StepStarted {
                job_id,
                step: descriptor.name().to_string(),
                index: index as u32,
                total,
            });

            if skip_remote && descriptor.kind.requires_registry() {
                let reason = "registry unavailable".to_string();
                self.skip(descriptor, &reason).await;
                results.insert(descriptor.name().to_string(), StepResult::Skipped { reason });
                continue;
            }

            let step = (self.factory)(descriptor);
            let mut ctx = StepContext::new(self.env.clone(), descriptor.clone(), artifacts);
            let result = execute(step.as_ref(), &mut ctx).await;
            let error_count = ctx.errors().len();
            artifacts = ctx.into_artifacts();

            let settled = match result {
                Ok(output) => StepResult::Completed(output),
                Err(e) if e.is_cancelled() => {
                    self.finish_event(descriptor, "cancelled", error_count);
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    let critical = descriptor.is_required() || e.is_authorization();
                    if critical {
                        critical_error = Some(format!("{} failed: {e}", descriptor.label()));
                    }
                    StepResult::Failed {
                        error: e.to_string(),
                        critical,
                    }
                }
            };
            self.finish_event(descriptor, settled.outcome(), error_count);
            results.insert(descriptor.name().to_string(), settled);
            if critical_error.is_some() {
                break;
            }
        }

        // ── Finalize ────────────────────────────────────────────────
        if cancelled {
            // Usually already cancelled by whoever asked; this is a no-op then.
            self.env.store.mark_cancelled(job_id).await?;
        } else if let Some(message) = &critical_error {
            // The lifecycle normally got here first; the earlier verdict wins.
            self.env.store.mark_failed(job_id, message, message).await?;
        } else {
            self.run_hooks(&results).await;
            self.env
                .store
                .update_progress(job_id, "Finished", 100, Some(total))
                .await?;
            if !self.env.store.mark_completed(job_id).await? {
                debug!(job_id = %job_id, "Job settled elsewhere before completion");
            }
        }

        self.settle(results, critical_error).await
    }

    /// Block while the job is paused. Returns `Continue` or `Cancelled`.
    async fn wait_at_boundary(&self, next: &StepDescriptor) -> Result<Checkpoint, DatabaseError> {
        let mut announced = false;
        loop {
            match self.env.cancel.checkpoint().await? {
                Checkpoint::Paused => {
                    if !announced {
                        self.env
                            .log
                            .info(PIPELINE_STEP, format!("Paused before {}", next.label()))
                            .await;
                        announced = true;
                    }
                    tokio::time::sleep(self.settings.pause_poll_interval).await;
                }
                Checkpoint::Continue => {
                    if announced {
                        self.env.log.info(PIPELINE_STEP, "Resumed").await;
                    }
                    return Ok(Checkpoint::Continue);
                }
                Checkpoint::Cancelled => return Ok(Checkpoint::Cancelled),
            }
        }
    }

    async fn skip(&self, descriptor: &StepDescriptor, reason: &str) {
        self.env
            .log
            .write(
                LogLevel::Warning,
                descriptor.label(),
                format!("Skipped: {reason}"),
                Some(serde_json::json!({ "skipped": true })),
            )
            .await;
        let stats = StepStatistics {
            skipped: true,
            ..StepStatistics::default()
        };
        if let Err(e) = self
            .env
            .store
            .record_step_statistics(self.env.job_id, descriptor.name(), &stats)
            .await
        {
            warn!(job_id = %self.env.job_id, error = %e, "Failed to record skipped step");
        }
        self.finish_event(descriptor, "skipped", 0);
    }

    fn finish_event(&self, descriptor: &StepDescriptor, outcome: &str, error_count: usize) {
        self.env.live.publish(JobEvent::StepFinished {
            job_id: self.env.job_id,
            step: descriptor.name().to_string(),
            outcome: outcome.to_string(),
            error_count,
        });
    }

    async fn run_hooks(&self, results: &BTreeMap<String, StepResult>) {
        for hook in &self.hooks {
            match hook.run(&self.env, results).await {
                Ok(message) => self.env.log.info("Finalize", message).await,
                Err(e) => {
                    self.env
                        .log
                        .warning("Finalize", format!("{} failed: {e}", hook.name()))
                        .await
                }
            }
        }
    }

    /// Read back the authoritative status.
    async fn settle(
        &self,
        results: BTreeMap<String, StepResult>,
        critical_error: Option<String>,
    ) -> Result<PipelineOutcome, Error> {
        let status = self
            .env
            .store
            .get_status(self.env.job_id)
            .await?
            .ok_or(JobError::NotFound {
                id: self.env.job_id,
            })?;
        info!(job_id = %self.env.job_id, status = status.as_str(), "Pipeline settled");
        Ok(PipelineOutcome {
            status,
            results,
            critical_error,
        })
    }
}
