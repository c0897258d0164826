//! Persistence traits — job records, their logs, and the catalog the
//! pipeline imports into.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::ImportConfig;
use crate::error::{DatabaseError, Error};
use crate::job::inconsistency::{Inconsistency, InconsistencyKind};
use crate::job::log::LogEntry;
use crate::job::state::{JobRecord, JobStatus, StepProgress, StepStatistics, SubtaskSnapshot};
use crate::registry::RecordKind;

/// A record imported from the registry.
#[derive(Debug, Clone)]
pub struct CatalogRecord {
    pub kind: RecordKind,
    pub external_id: String,
    pub payload: serde_json::Value,
    pub imported_by: Option<Uuid>,
    pub imported_at: DateTime<Utc>,
}

/// Storage for job records and their append-only logs.
///
/// The owning pipeline is the only writer of a running record. Once a
/// record is terminal every mutating call is a no-op.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a pending record after validating `config`.
    async fn create_job(&self, owner: &str, config: ImportConfig) -> Result<JobRecord, Error>;

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError>;

    /// Most recent jobs first.
    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, DatabaseError>;

    /// Current status only; this is the cancellation checkpoint's read.
    async fn get_status(&self, id: Uuid) -> Result<Option<JobStatus>, DatabaseError>;

    /// Pending → running and fix `total_steps`.
    async fn mark_running(&self, id: Uuid, total_steps: u32) -> Result<bool, DatabaseError>;

    /// Administrative status flip (pause/resume). Only applies when the
    /// transition is valid; returns whether it happened.
    async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<bool, DatabaseError>;

    /// Set the step label and progress. With `step_index`, also set
    /// `completed_steps` and start a new step (progress may reset); without
    /// it, progress never decreases.
    async fn update_progress(
        &self,
        id: Uuid,
        step_label: &str,
        percent: u8,
        step_index: Option<u32>,
    ) -> Result<(), DatabaseError>;

    /// Write `progress_data.steps[step]`.
    async fn record_step_progress(
        &self,
        id: Uuid,
        step: &str,
        progress: &StepProgress,
    ) -> Result<(), DatabaseError>;

    /// Write `progress_data.current_subtask`. Callers throttle.
    async fn record_subtask_progress(
        &self,
        id: Uuid,
        subtask: &SubtaskSnapshot,
    ) -> Result<(), DatabaseError>;

    async fn clear_subtask_progress(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn record_step_statistics(
        &self,
        id: Uuid,
        step: &str,
        stats: &StepStatistics,
    ) -> Result<(), DatabaseError>;

    /// Terminal transitions. Each returns `false` (and changes nothing) if
    /// the record is already terminal.
    async fn mark_completed(&self, id: Uuid) -> Result<bool, DatabaseError>;

    async fn mark_failed(&self, id: Uuid, message: &str, trace: &str)
    -> Result<bool, DatabaseError>;

    async fn mark_cancelled(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Logs ────────────────────────────────────────────────────────

    async fn append_log(&self, entry: &LogEntry) -> Result<(), DatabaseError>;

    /// Most recent entries first.
    async fn list_logs(&self, job_id: Uuid, limit: usize) -> Result<Vec<LogEntry>, DatabaseError>;

    // ── Inconsistencies ─────────────────────────────────────────────

    /// Append to the job's inconsistency ledger. A reference already
    /// recorded for the job is kept once; returns the rows added.
    async fn record_inconsistencies(
        &self,
        job_id: Uuid,
        items: &[Inconsistency],
    ) -> Result<usize, DatabaseError>;

    /// Most recent first.
    async fn list_inconsistencies(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Inconsistency>, DatabaseError>;

    /// Ledger size per kind.
    async fn count_inconsistencies(
        &self,
        job_id: Uuid,
    ) -> Result<BTreeMap<InconsistencyKind, u64>, DatabaseError>;
}

/// Destination for imported registry records.
///
/// Stands in for the bibliographic data model: records are opaque JSON
/// payloads keyed by kind and registry id.
#[async_trait]
pub trait CatalogSink: Send + Sync {
    /// Insert or replace one record. Returns `true` if it was new.
    async fn upsert_record(
        &self,
        kind: RecordKind,
        external_id: &str,
        payload: &serde_json::Value,
        job_id: Option<Uuid>,
    ) -> Result<bool, DatabaseError>;

    async fn get_record(
        &self,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<Option<CatalogRecord>, DatabaseError>;

    /// Delete every record of a kind. Returns the number removed.
    async fn delete_records(&self, kind: RecordKind) -> Result<usize, DatabaseError>;

    async fn count_records(&self, kind: RecordKind) -> Result<u64, DatabaseError>;

    /// Registry ids of `target` records referenced from `from` payloads
    /// (via `reference_field`) that are not yet in the catalog.
    async fn missing_references(
        &self,
        from: RecordKind,
        reference_field: &str,
        target: RecordKind,
    ) -> Result<Vec<String>, DatabaseError>;

    /// Make sure an organizational unit exists; returns its id.
    async fn ensure_unit(
        &self,
        name: &str,
        abbreviation: Option<&str>,
    ) -> Result<String, DatabaseError>;

    /// Rebuild derived per-kind counters. Returns the kinds refreshed.
    async fn refresh_statistics(&self) -> Result<usize, DatabaseError>;
}
