//! Finalize hooks run after the last step of a successful run.
//!
//! Hooks are best-effort: a failing hook is logged as a warning and never
//! changes the verdict of the run.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::StepError;
use crate::pipeline::orchestrator::StepResult;
use crate::steps::RunEnv;

/// Post-run task.
#[async_trait]
pub trait FinalizeHook: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the hook. The returned text is written to the job log.
    async fn run(
        &self,
        env: &RunEnv,
        results: &BTreeMap<String, StepResult>,
    ) -> Result<String, StepError>;
}

/// Rebuild the per-kind catalog counters shown on dashboards.
pub struct RefreshCatalogStatistics;

#[async_trait]
impl FinalizeHook for RefreshCatalogStatistics {
    fn name(&self) -> &'static str {
        "refresh_catalog_statistics"
    }

    async fn run(
        &self,
        env: &RunEnv,
        _results: &BTreeMap<String, StepResult>,
    ) -> Result<String, StepError> {
        let kinds = env.catalog.refresh_statistics().await?;
        Ok(format!("Refreshed catalog statistics for {kinds} record kinds"))
    }
}

/// One-line summary of the run, built from the step results and the
/// statistics persisted on the job record.
pub struct RunSummary;

#[async_trait]
impl FinalizeHook for RunSummary {
    fn name(&self) -> &'static str {
        "run_summary"
    }

    async fn run(
        &self,
        env: &RunEnv,
        results: &BTreeMap<String, StepResult>,
    ) -> Result<String, StepError> {
        let job = env
            .store
            .get_job(env.job_id)
            .await?
            .ok_or_else(|| StepError::Failed(format!("job {} disappeared", env.job_id)))?;

        let count = |outcome: &str| results.values().filter(|r| r.outcome() == outcome).count();
        let processed: u64 = job.statistics.values().map(|s| s.processed).sum();
        let errors: usize = job.statistics.values().map(|s| s.errors).sum();

        Ok(format!(
            "{} steps completed, {} failed, {} skipped; {processed} units processed with {errors} errors in {}s",
            count("completed"),
            count("failed"),
            count("skipped"),
            job.duration().as_secs()
        ))
    }
}

/// Hooks installed on every orchestrator, in execution order.
pub fn default_hooks() -> Vec<Box<dyn FinalizeHook>> {
    vec![Box::new(RefreshCatalogStatistics), Box::new(RunSummary)]
}
