//! Uniform start / run / finish wrapper around every step.

use std::time::Instant;

use crate::error::{StepError, error_trace};
use crate::job::log::LogLevel;
use crate::job::state::StepStatistics;
use crate::steps::{Step, StepContext, StepOutput};

/// Errors listed in the "completed with errors" log entry.
const LOGGED_ERROR_LIMIT: usize = 10;

/// Run `step` inside the lifecycle.
///
/// Any error escaping `run()` is logged here exactly once and handed back
/// to the orchestrator. Pipeline-fatal failures (a required step, or an
/// authorization-class error) also mark the job record failed right away,
/// so the record keeps the first critical error.
pub async fn execute(step: &dyn Step, ctx: &mut StepContext) -> Result<StepOutput, StepError> {
    let started = Instant::now();
    let description = step.description();

    ctx.log(LogLevel::Info, format!("Starting: {description}"), None)
        .await;
    let env = ctx.env().clone();
    if let Err(e) = env
        .store
        .update_progress(env.job_id, ctx.descriptor().label(), 0, None)
        .await
    {
        tracing::warn!(job_id = %env.job_id, error = %e, "Failed to set current step");
    }

    let result = step.run(ctx).await;
    let elapsed = started.elapsed();

    if let Err(e) = env.store.clear_subtask_progress(env.job_id).await {
        tracing::debug!(job_id = %env.job_id, error = %e, "Failed to clear subtask progress");
    }

    match result {
        Ok(mut output) => {
            let errors = ctx.errors();
            let seconds = elapsed.as_secs_f64();
            if errors.is_empty() {
                ctx.log(
                    LogLevel::Success,
                    format!("Completed in {seconds:.2}s"),
                    None,
                )
                .await;
            } else {
                let shown: Vec<&String> = errors.iter().take(LOGGED_ERROR_LIMIT).collect();
                ctx.log(
                    LogLevel::Warning,
                    format!("Completed with {} errors in {seconds:.2}s", errors.len()),
                    Some(serde_json::json!({ "errors": shown })),
                )
                .await;
            }

            record_statistics(ctx, elapsed.as_millis() as u64, ctx.errors().len()).await;
            output.insert("error_count".into(), serde_json::json!(ctx.errors().len()));
            Ok(output)
        }
        Err(StepError::Cancelled) => {
            ctx.log(LogLevel::Warning, "Import cancelled during this step", None)
                .await;
            record_statistics(ctx, elapsed.as_millis() as u64, ctx.errors().len()).await;
            Err(StepError::Cancelled)
        }
        Err(e) => {
            let message = format!("{} failed: {e}", ctx.descriptor().label());
            let trace = error_trace(&e);
            let authorization = e.is_authorization();
            let fatal = ctx.descriptor().is_required() || authorization;

            ctx.log(
                LogLevel::Critical,
                message.clone(),
                Some(serde_json::json!({
                    "step": ctx.descriptor().name(),
                    "error": e.to_string(),
                    "trace": trace,
                    "authorization": authorization,
                    "required": ctx.descriptor().is_required(),
                    "errors_before_failure": ctx.errors().len(),
                })),
            )
            .await;
            record_statistics(ctx, elapsed.as_millis() as u64, ctx.errors().len() + 1).await;

            if fatal {
                match env.store.mark_failed(env.job_id, &message, &trace).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(job_id = %env.job_id, "Job already terminal; keeping earlier verdict")
                    }
                    Err(db) => {
                        tracing::warn!(job_id = %env.job_id, error = %db, "Failed to mark job failed")
                    }
                }
            }
            Err(e)
        }
    }
}

async fn record_statistics(ctx: &StepContext, elapsed_ms: u64, errors: usize) {
    let env = ctx.env();
    let stats = StepStatistics {
        processed: ctx.processed(),
        errors,
        elapsed_ms,
        skipped: false,
    };
    if let Err(e) = env
        .store
        .record_step_statistics(env.job_id, ctx.descriptor().name(), &stats)
        .await
    {
        tracing::warn!(job_id = %env.job_id, error = %e, "Failed to record step statistics");
    }
}
