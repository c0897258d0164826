//! Job record system — persisted state of one pipeline run.
//!
//! Core components:
//! - `state` — Job record and status machine (Pending → Running → Completed/Failed/Cancelled)
//! - `progress` — Throttled subtask progress reporter
//! - `cancel` — Cooperative cancellation token
//! - `log` — Append-only job log sink
//! - `inconsistency` — Unresolved references found during a run

pub mod cancel;
pub mod inconsistency;
pub mod log;
pub mod progress;
pub mod state;

pub use cancel::{CANCEL_CHECK_INTERVAL, CancellationToken, Checkpoint};
pub use inconsistency::{Inconsistency, InconsistencyKind};
pub use log::{JobLog, LogEntry, LogLevel};
pub use progress::SubtaskProgress;
pub use state::{
    JobRecord, JobStatus, ProgressData, StepProgress, StepStatistics, SubtaskSnapshot,
};
