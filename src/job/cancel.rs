//! Cooperative cancellation checkpoint.
//!
//! Cancellation is requested by flipping the job record's status from
//! outside the worker. The token re-reads that status on demand; steps
//! poll it every [`CANCEL_CHECK_INTERVAL`] units of work.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::state::JobStatus;
use crate::store::JobStore;

/// Units of work between two cancellation checks inside a loop.
pub const CANCEL_CHECK_INTERVAL: usize = 10;

/// What the run should do at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Paused,
    Cancelled,
}

/// Handle used by steps and the orchestrator to observe cancel requests.
#[derive(Clone)]
pub struct CancellationToken {
    job_id: Uuid,
    store: Arc<dyn JobStore>,
}

impl CancellationToken {
    pub fn new(job_id: Uuid, store: Arc<dyn JobStore>) -> Self {
        Self { job_id, store }
    }

    /// Whether loop iteration `index` should pay for a status re-read.
    pub fn should_check(index: usize) -> bool {
        index % CANCEL_CHECK_INTERVAL == 0
    }

    /// Re-read the job's status and classify it.
    pub async fn checkpoint(&self) -> Result<Checkpoint, DatabaseError> {
        let status = self
            .store
            .get_status(self.job_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "job".into(),
                id: self.job_id.to_string(),
            })?;
        Ok(match status {
            JobStatus::Cancelled => Checkpoint::Cancelled,
            JobStatus::Paused => Checkpoint::Paused,
            _ => Checkpoint::Continue,
        })
    }

    /// True once a cancel request has been observed. A failed status read
    /// is treated as "not cancelled" so a flaky store cannot stop a run.
    pub async fn is_cancelled(&self) -> bool {
        match self.checkpoint().await {
            Ok(checkpoint) => checkpoint == Checkpoint::Cancelled,
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Cancellation check failed");
                false
            }
        }
    }
}
