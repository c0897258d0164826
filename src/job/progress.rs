//! Throttled subtask progress reporting.
//!
//! Inner loops over thousands of remote items would otherwise write the
//! job record on every iteration. The reporter persists at most once per
//! `interval`, plus the final 100% update.

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::state::{SubtaskSnapshot, percent};
use crate::live::{JobEvent, LiveChannel};
use crate::store::JobStore;

/// Progress reporter for one inner loop of one step.
pub struct SubtaskProgress {
    job_id: Uuid,
    name: String,
    store: Arc<dyn JobStore>,
    live: LiveChannel,
    interval: Duration,
    last_write: Option<Instant>,
    writes: usize,
}

impl SubtaskProgress {
    pub fn new(
        job_id: Uuid,
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        live: LiveChannel,
        interval: Duration,
    ) -> Self {
        Self {
            job_id,
            name: name.into(),
            store,
            live,
            interval,
            last_write: None,
            writes: 0,
        }
    }

    /// Report `current` of `total`. Skipped unless the interval has elapsed
    /// since the last write or this is the final update.
    pub async fn update(
        &mut self,
        current: u64,
        total: u64,
        description: &str,
    ) -> Result<(), DatabaseError> {
        let is_final = current >= total;
        if let Some(last) = self.last_write
            && last.elapsed() < self.interval
            && !is_final
        {
            return Ok(());
        }

        let snapshot = SubtaskSnapshot {
            name: self.name.clone(),
            description: description.to_string(),
            current,
            total,
            percentage: percent(current, total),
        };
        self.store
            .record_subtask_progress(self.job_id, &snapshot)
            .await?;
        self.live.publish(JobEvent::Subtask {
            job_id: self.job_id,
            subtask: snapshot,
        });

        self.last_write = Some(Instant::now());
        self.writes += 1;
        Ok(())
    }

    /// Remove the subtask descriptor from the job record.
    pub async fn clear(&mut self) -> Result<(), DatabaseError> {
        self.store.clear_subtask_progress(self.job_id).await
    }

    /// Number of persisted writes so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImportConfig;
    use crate::store::LibSqlBackend;

    async fn setup() -> (Arc<dyn JobStore>, Uuid) {
        let store: Arc<dyn JobStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let job = store.create_job("admin", ImportConfig::default()).await.unwrap();
        (store, job.id)
    }

    #[tokio::test]
    async fn tight_loop_is_throttled() {
        let (store, job_id) = setup().await;
        let interval = Duration::from_millis(500);
        let mut reporter = SubtaskProgress::new(
            job_id,
            "Fetching authors",
            Arc::clone(&store),
            LiveChannel::new(8),
            interval,
        );

        let started = Instant::now();
        for i in 1..=1000u64 {
            reporter.update(i, 1000, "authors").await.unwrap();
        }
        let elapsed = started.elapsed();

        // One write per elapsed interval, the first call, and the final 100%.
        let bound = (elapsed.as_millis() / interval.as_millis()) as usize + 2;
        assert!(
            reporter.writes() <= bound,
            "{} writes exceeds bound {bound}",
            reporter.writes()
        );
        assert!(reporter.writes() < 1000);

        let job = store.get_job(job_id).await.unwrap().unwrap();
        let subtask = job.progress_data.current_subtask.unwrap();
        assert_eq!(subtask.current, 1000);
        assert_eq!(subtask.percentage, 100);
        assert_eq!(subtask.name, "Fetching authors");
    }

    #[tokio::test]
    async fn final_update_is_always_written() {
        let (store, job_id) = setup().await;
        let mut reporter = SubtaskProgress::new(
            job_id,
            "Fees",
            Arc::clone(&store),
            LiveChannel::new(8),
            Duration::from_secs(3600),
        );
        reporter.update(1, 3, "").await.unwrap();
        reporter.update(2, 3, "").await.unwrap();
        reporter.update(3, 3, "").await.unwrap();
        assert_eq!(reporter.writes(), 2);
    }

    #[tokio::test]
    async fn clear_removes_descriptor() {
        let (store, job_id) = setup().await;
        let mut reporter = SubtaskProgress::new(
            job_id,
            "Sources",
            Arc::clone(&store),
            LiveChannel::new(8),
            Duration::ZERO,
        );
        reporter.update(1, 2, "page 1").await.unwrap();
        assert!(
            store
                .get_job(job_id)
                .await
                .unwrap()
                .unwrap()
                .progress_data
                .current_subtask
                .is_some()
        );

        reporter.clear().await.unwrap();
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert!(job.progress_data.current_subtask.is_none());
    }
}
