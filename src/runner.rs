//! Job service — the worker-side entry point and the administrative
//! surface over job records.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ImportConfig, PipelineSettings};
use crate::error::{Error, JobError, error_trace};
use crate::job::log::{LogEntry, LogLevel};
use crate::job::state::{JobRecord, JobStatus};
use crate::live::{JobEvent, LiveChannel};
use crate::pipeline::{Orchestrator, PipelineOutcome, RunControl};
use crate::registry::RegistryClient;
use crate::steps::RunEnv;
use crate::store::{CatalogSink, JobStore, LibSqlBackend};

/// Creates, runs and steers import jobs.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    catalog: Arc<dyn CatalogSink>,
    client: Option<Arc<dyn RegistryClient>>,
    live: LiveChannel,
    settings: PipelineSettings,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        catalog: Arc<dyn CatalogSink>,
        client: Option<Arc<dyn RegistryClient>>,
        live: LiveChannel,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            client,
            live,
            settings,
        }
    }

    /// Service over one libSQL database serving as both job store and catalog.
    pub fn with_backend(
        db: Arc<LibSqlBackend>,
        client: Option<Arc<dyn RegistryClient>>,
        live: LiveChannel,
        settings: PipelineSettings,
    ) -> Self {
        Self::new(db.clone(), db, client, live, settings)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn live(&self) -> &LiveChannel {
        &self.live
    }

    /// Validate `config` and create a pending job.
    pub async fn start(&self, owner: &str, config: ImportConfig) -> Result<JobRecord, Error> {
        let job = self.store.create_job(owner, config).await?;
        info!(job_id = %job.id, owner, "Import job created");
        Ok(job)
    }

    /// Run a job on its own task.
    pub fn spawn(&self, job_id: Uuid) -> JoinHandle<Result<PipelineOutcome, Error>> {
        let service = self.clone();
        tokio::spawn(async move { service.run(job_id).await })
    }

    /// Execute a pending job to a terminal status. A paused job already
    /// has a worker parked on it; `resume` hands control back to that one.
    pub async fn run(&self, job_id: Uuid) -> Result<PipelineOutcome, Error> {
        let job = self.status(job_id).await?;
        if job.status != JobStatus::Pending {
            return Err(JobError::InvalidTransition {
                id: job_id,
                state: job.status.as_str().to_string(),
                target: JobStatus::Running.as_str().to_string(),
            }
            .into());
        }

        let started = Instant::now();
        let env = RunEnv::new(
            job_id,
            Arc::clone(&self.store),
            Arc::clone(&self.catalog),
            self.client.clone(),
            self.live.clone(),
            self.settings.progress_interval,
        );
        env.log
            .info("Start", format!("Import started by {}", job.owner))
            .await;
        if env.client.is_none() {
            env.log
                .warning("Setup", "No registry client configured; only local steps can run")
                .await;
        }

        let result = Orchestrator::new(env.clone(), job.config, self.settings.clone())
            .run()
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = format!("Import aborted: {e}");
                let trace = error_trace(&e);
                env.log
                    .critical("End", message.clone(), serde_json::json!({ "trace": trace }))
                    .await;
                if let Err(db) = self.store.mark_failed(job_id, &message, &trace).await {
                    warn!(job_id = %job_id, error = %db, "Failed to mark aborted job failed");
                }
                self.live.publish(JobEvent::Completion {
                    job_id,
                    status: JobStatus::Failed,
                    success: false,
                    message,
                });
                return Err(e);
            }
        };

        let seconds = started.elapsed().as_secs_f64();
        let (level, message) = match outcome.status {
            JobStatus::Completed => (LogLevel::Success, format!("Import completed in {seconds:.1}s")),
            JobStatus::Cancelled => (LogLevel::Warning, format!("Import cancelled after {seconds:.1}s")),
            JobStatus::Failed => (
                LogLevel::Error,
                outcome
                    .critical_error
                    .clone()
                    .unwrap_or_else(|| "Import failed".to_string()),
            ),
            other => (LogLevel::Warning, format!("Import stopped while {}", other.as_str())),
        };
        env.log
            .write(
                level,
                "End",
                message.clone(),
                Some(serde_json::json!({ "results": outcome.results })),
            )
            .await;
        self.live.publish(JobEvent::Completion {
            job_id,
            status: outcome.status,
            success: outcome.is_success(),
            message,
        });
        Ok(outcome)
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<(), Error> {
        self.control(job_id).cancel().await
    }

    pub async fn pause(&self, job_id: Uuid) -> Result<(), Error> {
        self.control(job_id).pause().await
    }

    pub async fn resume(&self, job_id: Uuid) -> Result<(), Error> {
        self.control(job_id).resume().await
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobRecord, Error> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound { id: job_id }.into())
    }

    /// The most recent `limit` log entries, oldest first.
    pub async fn logs(&self, job_id: Uuid, limit: usize) -> Result<Vec<LogEntry>, Error> {
        let mut entries = self.store.list_logs(job_id, limit).await?;
        entries.reverse();
        Ok(entries)
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<JobRecord>, Error> {
        Ok(self.store.list_jobs(limit).await?)
    }

    fn control(&self, job_id: Uuid) -> RunControl {
        RunControl::new(job_id, Arc::clone(&self.store))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::StepToggles;
    use crate::pipeline::registry::StepKind;

    async fn service() -> JobService {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        JobService::with_backend(
            db,
            None,
            LiveChannel::new(256),
            PipelineSettings {
                progress_interval: Duration::ZERO,
                pause_poll_interval: Duration::from_millis(10),
            },
        )
    }

    fn local_only() -> ImportConfig {
        let mut steps = StepToggles::none();
        steps.set(StepKind::InitialSetup, true);
        steps.set(StepKind::InstitutionSetup, true);
        ImportConfig {
            steps,
            ..ImportConfig::default()
        }
    }

    #[tokio::test]
    async fn local_run_completes_and_announces_it() {
        let service = service().await;
        let mut events = service.live().subscribe();
        let job = service.start("admin", local_only()).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let outcome = service.run(job.id).await.unwrap();
        assert!(outcome.is_success());

        let record = service.status(job.id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.overall_progress(), 100);

        let logs = service.logs(job.id, 500).await.unwrap();
        assert_eq!(logs.first().unwrap().step, "Start");
        assert_eq!(logs.last().unwrap().step, "End");
        assert!(logs.iter().any(|l| l.step == "Setup" && l.level == LogLevel::Warning));

        let mut completion = None;
        while let Ok(event) = events.try_recv() {
            if event.is_terminal() {
                completion = Some(event);
            }
        }
        assert!(matches!(
            completion,
            Some(JobEvent::Completion { success: true, status: JobStatus::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn remote_steps_without_client_fail_the_run() {
        let service = service().await;
        let job = service.start("admin", ImportConfig::default()).await.unwrap();
        let outcome = service.run(job.id).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.results.is_empty());

        let record = service.status(job.id).await.unwrap();
        assert!(record.error_message.unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn finished_jobs_cannot_run_again() {
        let service = service().await;
        let job = service.start("admin", local_only()).await.unwrap();
        service.run(job.id).await.unwrap();
        assert!(matches!(
            service.run(job.id).await,
            Err(Error::Job(JobError::InvalidTransition { .. }))
        ));
        assert!(service.cancel(job.id).await.is_err());
    }

    #[tokio::test]
    async fn paused_job_is_not_picked_up_by_a_second_worker() {
        let service = service().await;
        let job = service.start("admin", local_only()).await.unwrap();
        // Stand-in for a worker parked at a step boundary.
        assert!(service.store().mark_running(job.id, 2).await.unwrap());
        service.pause(job.id).await.unwrap();

        assert!(matches!(
            service.run(job.id).await,
            Err(Error::Job(JobError::InvalidTransition { .. }))
        ));
        let second = service.spawn(job.id).await.unwrap();
        assert!(second.is_err());

        let record = service.status(job.id).await.unwrap();
        assert_eq!(record.status, JobStatus::Paused);
        assert!(service.logs(job.id, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let service = service().await;
        assert!(matches!(
            service.status(Uuid::new_v4()).await,
            Err(Error::Job(JobError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn cancelled_pending_job_never_starts() {
        let service = service().await;
        let job = service.start("admin", local_only()).await.unwrap();
        service.cancel(job.id).await.unwrap();
        assert!(service.run(job.id).await.is_err());
        assert_eq!(service.status(job.id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_creation() {
        let service = service().await;
        let config = ImportConfig {
            steps: StepToggles::none(),
            ..ImportConfig::default()
        };
        assert!(matches!(
            service.start("admin", config).await,
            Err(Error::Config(_))
        ));
        assert!(service.list(10).await.unwrap().is_empty());
    }
}
