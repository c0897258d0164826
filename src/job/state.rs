//! Job record and its status state machine.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ImportConfig;

/// Status of an import job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet picked up by a worker.
    Pending,
    /// The orchestrator is executing steps.
    Running,
    /// Held at the next step boundary until resumed.
    Paused,
    /// All steps settled without a critical error.
    Completed,
    /// A critical error ended the run.
    Failed,
    /// Stopped on request; partial results are kept.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled) |
            // From Running
            (Running, Paused) | (Running, Completed) |
            (Running, Failed) | (Running, Cancelled) |
            // From Paused; a pause requested during the last step has
            // no boundary left to hold, so the run still completes.
            (Paused, Running) | (Paused, Completed) |
            (Paused, Cancelled) | (Paused, Failed)
        )
    }

    /// Operator-requested flips. Everything else goes through the
    /// worker's `mark_*` calls.
    pub fn can_pause_or_resume_to(&self, target: JobStatus) -> bool {
        matches!(
            (self, target),
            (Self::Running, Self::Paused) | (Self::Paused, Self::Running)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => return Err(format!("unknown job status: {other}")),
        })
    }
}

/// Coarse progress of one step, keyed by step name in [`ProgressData`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    pub processed: u64,
    pub total: u64,
    pub progress: u8,
    pub message: String,
    pub errors: usize,
}

/// Fine-grained progress of the inner loop currently reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskSnapshot {
    pub name: String,
    pub description: String,
    pub current: u64,
    pub total: u64,
    pub percentage: u8,
}

/// Nested progress document stored on the job record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressData {
    #[serde(default)]
    pub steps: BTreeMap<String, StepProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_subtask: Option<SubtaskSnapshot>,
}

/// Per-step statistics written when a step finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatistics {
    pub processed: u64,
    pub errors: usize,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub skipped: bool,
}

/// Integer percentage of `current` out of `total`, clamped to 0..=100.
pub fn percent(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((current.min(total) * 100) / total) as u8
}

/// One run of the import pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    /// Who launched the run.
    pub owner: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Label of the step in flight.
    pub current_step: String,
    pub current_step_progress: u8,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub progress_data: ProgressData,
    pub config: ImportConfig,
    pub statistics: BTreeMap<String, StepStatistics>,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
}

impl JobRecord {
    /// A fresh pending record.
    pub fn new(owner: impl Into<String>, config: ImportConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            status: JobStatus::Pending,
            started_at: now,
            completed_at: None,
            updated_at: now,
            current_step: String::new(),
            current_step_progress: 0,
            total_steps: 0,
            completed_steps: 0,
            progress_data: ProgressData::default(),
            config,
            statistics: BTreeMap::new(),
            error_message: None,
            error_trace: None,
        }
    }

    /// Overall progress across all steps, 0..=100.
    pub fn overall_progress(&self) -> u8 {
        if self.total_steps == 0 {
            return 0;
        }
        let total = self.total_steps as u64;
        let completed = (self.completed_steps as u64).min(total);
        let scaled = completed * 100 + self.current_step_progress.min(100) as u64;
        (scaled / total).min(100) as u8
    }

    /// Time from start to completion, or to now while the run is live.
    pub fn duration(&self) -> Duration {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Paused));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Paused));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn overall_progress_formula() {
        let mut job = JobRecord::new("admin", ImportConfig::default());
        assert_eq!(job.overall_progress(), 0);

        job.total_steps = 4;
        job.completed_steps = 1;
        job.current_step_progress = 50;
        // 100*1/4 + 50/4 = 25 + 12.5
        assert_eq!(job.overall_progress(), 37);

        job.completed_steps = 4;
        job.current_step_progress = 100;
        assert_eq!(job.overall_progress(), 100);
    }

    #[test]
    fn overall_progress_never_exceeds_100() {
        let mut job = JobRecord::new("admin", ImportConfig::default());
        job.total_steps = 3;
        job.completed_steps = 3;
        job.current_step_progress = 100;
        assert_eq!(job.overall_progress(), 100);
    }

    #[test]
    fn overall_progress_is_monotonic_across_step_boundaries() {
        let mut job = JobRecord::new("admin", ImportConfig::default());
        job.total_steps = 3;
        let mut last = 0;
        for step in 0..3 {
            job.completed_steps = step;
            for p in [0u8, 33, 66, 100] {
                job.current_step_progress = p;
                let now = job.overall_progress();
                assert!(now >= last, "progress went from {last} to {now}");
                last = now;
            }
        }
    }

    #[test]
    fn duration_uses_completed_at_when_terminal() {
        let mut job = JobRecord::new("admin", ImportConfig::default());
        job.completed_at = Some(job.started_at + chrono::Duration::seconds(90));
        assert_eq!(job.duration(), Duration::from_secs(90));
    }

    #[test]
    fn percent_handles_zero_and_overshoot() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(5, 10), 50);
        assert_eq!(percent(15, 10), 100);
    }

    #[test]
    fn job_status_serde_roundtrip() {
        let json = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let parsed: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, JobStatus::Cancelled);
        assert_eq!("paused".parse::<JobStatus>().unwrap(), JobStatus::Paused);
    }
}
