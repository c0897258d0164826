//! libSQL backend implementing `JobStore` and `CatalogSink`.
//!
//! Supports local file and in-memory databases. The terminal-freeze and
//! progress monotonicity rules of a job record live in the UPDATE
//! statements themselves, so a late write from a cancelled worker can
//! never resurrect a finished record.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ImportConfig;
use crate::error::{DatabaseError, Error};
use crate::job::inconsistency::{Inconsistency, InconsistencyKind};
use crate::job::log::{LogEntry, LogLevel};
use crate::job::state::{
    JobRecord, JobStatus, ProgressData, StepProgress, StepStatistics, SubtaskSnapshot,
};
use crate::registry::RecordKind;
use crate::store::migrations;
use crate::store::traits::{CatalogRecord, CatalogSink, JobStore};

/// Quoted SQL list of the statuses allowed to move to `target`.
fn sources_of(target: JobStatus) -> String {
    JobStatus::ALL
        .iter()
        .filter(|s| s.can_transition_to(target))
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

const JOB_COLUMNS: &str = "id, owner, status, started_at, completed_at, updated_at, \
     current_step, current_step_progress, total_steps, completed_steps, \
     progress_data, config, statistics, error_message, error_trace";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Per-kind record counts as of the last `refresh_statistics`.
    pub async fn catalog_statistics(&self) -> Result<BTreeMap<String, u64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT kind, record_count FROM catalog_statistics ORDER BY kind",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("catalog_statistics: {e}")))?;

        let mut counts = BTreeMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let kind: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            counts.insert(kind, count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Read-modify-write one JSON column of a live job record.
    async fn update_json_column<T, F>(
        &self,
        id: Uuid,
        column: &'static str,
        op: &'static str,
        apply: F,
    ) -> Result<(), DatabaseError>
    where
        T: DeserializeOwned + Serialize + Default + Send,
        F: FnOnce(&mut T) + Send,
    {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {column} FROM import_jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let raw: String = match rows.next().await {
            Ok(Some(row)) => row.get(0).unwrap_or_default(),
            Ok(None) => {
                return Err(DatabaseError::NotFound {
                    entity: "job".into(),
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        };

        let mut value: T = parse_json_or_default(&raw);
        apply(&mut value);
        let json = serde_json::to_string(&value)
            .map_err(|e| DatabaseError::Serialization(format!("{op}: {e}")))?;

        conn.execute(
            &format!(
                "UPDATE import_jobs SET {column} = ?2, updated_at = ?3
                 WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')"
            ),
            params![id.to_string(), json, Utc::now().to_rfc3339()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        Ok(())
    }

    async fn fetch_jobs(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            jobs.push(
                row_to_job(&row).map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?,
            );
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn parse_json_or_default<T: DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

fn row_to_job(row: &libsql::Row) -> Result<JobRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(2)?;
    let started_str: String = row.get(3)?;
    let completed_str: Option<String> = row.get(4)?;
    let updated_str: String = row.get(5)?;
    let progress: i64 = row.get(7)?;
    let total: i64 = row.get(8)?;
    let completed: i64 = row.get(9)?;
    let progress_data: String = row.get(10)?;
    let config: String = row.get(11)?;
    let statistics: String = row.get(12)?;

    Ok(JobRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        owner: row.get(1)?,
        status: status_str.parse().unwrap_or(JobStatus::Failed),
        started_at: parse_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
        updated_at: parse_datetime(&updated_str),
        current_step: row.get(6)?,
        current_step_progress: progress.clamp(0, 100) as u8,
        total_steps: total.max(0) as u32,
        completed_steps: completed.max(0) as u32,
        progress_data: parse_json_or_default::<ProgressData>(&progress_data),
        config: serde_json::from_str::<ImportConfig>(&config).unwrap_or_default(),
        statistics: parse_json_or_default(&statistics),
        error_message: row.get(13)?,
        error_trace: row.get(14)?,
    })
}

fn row_to_log(row: &libsql::Row) -> Result<LogEntry, libsql::Error> {
    let id_str: String = row.get(0)?;
    let job_str: String = row.get(1)?;
    let ts_str: String = row.get(2)?;
    let level_str: String = row.get(3)?;
    let details: Option<String> = row.get(6)?;

    Ok(LogEntry {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        job_id: Uuid::parse_str(&job_str).unwrap_or_else(|_| Uuid::nil()),
        timestamp: parse_datetime(&ts_str),
        level: level_str.parse().unwrap_or(LogLevel::Info),
        step: row.get(4)?,
        message: row.get(5)?,
        details: details.and_then(|d| serde_json::from_str(&d).ok()),
    })
}

fn row_to_inconsistency(row: &libsql::Row) -> Result<Inconsistency, libsql::Error> {
    let job_str: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let referenced_by: String = row.get(2)?;
    let recorded_at: String = row.get(5)?;

    Ok(Inconsistency {
        job_id: Uuid::parse_str(&job_str).unwrap_or_else(|_| Uuid::nil()),
        kind: kind_str.parse().unwrap_or(InconsistencyKind::PublicationNotFound),
        referenced_by: referenced_by.parse().unwrap_or(RecordKind::Publication),
        reference_id: row.get(3)?,
        message: row.get(4)?,
        recorded_at: parse_datetime(&recorded_at),
    })
}

fn row_to_record(row: &libsql::Row) -> Result<CatalogRecord, libsql::Error> {
    let kind_str: String = row.get(0)?;
    let payload: String = row.get(2)?;
    let imported_by: Option<String> = row.get(3)?;
    let imported_at: String = row.get(4)?;

    Ok(CatalogRecord {
        kind: kind_str.parse().unwrap_or(RecordKind::Publication),
        external_id: row.get(1)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        imported_by: imported_by.and_then(|s| Uuid::parse_str(&s).ok()),
        imported_at: parse_datetime(&imported_at),
    })
}

/// Collect the registry ids a payload field refers to. Accepts a scalar or
/// an array of scalars; objects contribute their `id` / `objectId`.
fn reference_ids(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => out.push(s.clone()),
        serde_json::Value::Number(n) => out.push(n.to_string()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| reference_ids(v, out)),
        serde_json::Value::Object(map) => {
            if let Some(id) = map.get("id").or_else(|| map.get("objectId")) {
                reference_ids(id, out);
            }
        }
        _ => {}
    }
}

// ── JobStore ────────────────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn create_job(&self, owner: &str, config: ImportConfig) -> Result<JobRecord, Error> {
        config.validate()?;

        let job = JobRecord::new(owner, config);
        let config_json = serde_json::to_string(&job.config)
            .map_err(|e| DatabaseError::Serialization(format!("create_job: {e}")))?;
        let progress_json = serde_json::to_string(&job.progress_data)
            .map_err(|e| DatabaseError::Serialization(format!("create_job: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO import_jobs (id, owner, status, started_at, updated_at, progress_data, config, statistics)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}')",
                params![
                    job.id.to_string(),
                    job.owner.clone(),
                    job.status.as_str(),
                    job.started_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                    progress_json,
                    config_json,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_job: {e}")))?;

        debug!(job_id = %job.id, owner = %job.owner, "Import job created");
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let jobs = self
            .fetch_jobs(
                &format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = ?1"),
                params![id.to_string()],
                "get_job",
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, DatabaseError> {
        self.fetch_jobs(
            &format!("SELECT {JOB_COLUMNS} FROM import_jobs ORDER BY started_at DESC LIMIT ?1"),
            params![limit as i64],
            "list_jobs",
        )
        .await
    }

    async fn get_status(&self, id: Uuid) -> Result<Option<JobStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM import_jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_status: {e}")))?;
                status
                    .parse()
                    .map(Some)
                    .map_err(DatabaseError::Serialization)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_status: {e}"))),
        }
    }

    async fn mark_running(&self, id: Uuid, total_steps: u32) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE import_jobs SET status = 'running', total_steps = ?2, updated_at = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), total_steps as i64, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_running: {e}")))?;
        Ok(affected > 0)
    }

    async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<bool, DatabaseError> {
        let Some(current) = self.get_status(id).await? else {
            return Err(DatabaseError::NotFound {
                entity: "job".into(),
                id: id.to_string(),
            });
        };
        if !current.can_pause_or_resume_to(status) {
            return Ok(false);
        }

        let now = Utc::now().to_rfc3339();
        let completed_at = status.is_terminal().then(|| now.clone());
        // Compare-and-swap on the status we validated against.
        let affected = self
            .conn()
            .execute(
                "UPDATE import_jobs SET status = ?2, updated_at = ?3,
                     completed_at = COALESCE(?4, completed_at)
                 WHERE id = ?1 AND status = ?5",
                params![
                    id.to_string(),
                    status.as_str(),
                    now,
                    opt_text_owned(completed_at),
                    current.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_status: {e}")))?;
        Ok(affected > 0)
    }

    async fn update_progress(
        &self,
        id: Uuid,
        step_label: &str,
        percent: u8,
        step_index: Option<u32>,
    ) -> Result<(), DatabaseError> {
        let percent = percent.min(100) as i64;
        let now = Utc::now().to_rfc3339();
        let result = match step_index {
            Some(index) => {
                self.conn()
                    .execute(
                        "UPDATE import_jobs SET current_step = ?2, current_step_progress = ?3,
                             completed_steps = MAX(completed_steps, ?4),
                             updated_at = ?5
                         WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
                        params![id.to_string(), step_label, percent, index as i64, now],
                    )
                    .await
            }
            None => {
                self.conn()
                    .execute(
                        "UPDATE import_jobs SET current_step = ?2,
                             current_step_progress = MAX(current_step_progress, ?3),
                             updated_at = ?4
                         WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
                        params![id.to_string(), step_label, percent, now],
                    )
                    .await
            }
        };
        result.map_err(|e| DatabaseError::Query(format!("update_progress: {e}")))?;
        Ok(())
    }

    async fn record_step_progress(
        &self,
        id: Uuid,
        step: &str,
        progress: &StepProgress,
    ) -> Result<(), DatabaseError> {
        let step = step.to_string();
        let progress = progress.clone();
        self.update_json_column(
            id,
            "progress_data",
            "record_step_progress",
            move |data: &mut ProgressData| {
                data.steps.insert(step, progress);
            },
        )
        .await
    }

    async fn record_subtask_progress(
        &self,
        id: Uuid,
        subtask: &SubtaskSnapshot,
    ) -> Result<(), DatabaseError> {
        let subtask = subtask.clone();
        self.update_json_column(
            id,
            "progress_data",
            "record_subtask_progress",
            move |data: &mut ProgressData| data.current_subtask = Some(subtask),
        )
        .await
    }

    async fn clear_subtask_progress(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.update_json_column(
            id,
            "progress_data",
            "clear_subtask_progress",
            |data: &mut ProgressData| data.current_subtask = None,
        )
        .await
    }

    async fn record_step_statistics(
        &self,
        id: Uuid,
        step: &str,
        stats: &StepStatistics,
    ) -> Result<(), DatabaseError> {
        let step = step.to_string();
        let stats = stats.clone();
        self.update_json_column(
            id,
            "statistics",
            "record_step_statistics",
            move |map: &mut BTreeMap<String, StepStatistics>| {
                map.insert(step, stats);
            },
        )
        .await
    }

    async fn mark_completed(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "UPDATE import_jobs SET status = 'completed', completed_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status IN ({})",
            sources_of(JobStatus::Completed)
        );
        let affected = self
            .conn()
            .execute(&sql, params![id.to_string(), now])
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_completed: {e}")))?;
        Ok(affected > 0)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        message: &str,
        trace: &str,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "UPDATE import_jobs SET status = 'failed', completed_at = ?2, updated_at = ?2,
                 error_message = ?3, error_trace = ?4
             WHERE id = ?1 AND status IN ({})",
            sources_of(JobStatus::Failed)
        );
        let affected = self
            .conn()
            .execute(&sql, params![id.to_string(), now, message, trace])
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_failed: {e}")))?;
        Ok(affected > 0)
    }

    async fn mark_cancelled(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "UPDATE import_jobs SET status = 'cancelled', completed_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status IN ({})",
            sources_of(JobStatus::Cancelled)
        );
        let affected = self
            .conn()
            .execute(&sql, params![id.to_string(), now])
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_cancelled: {e}")))?;
        Ok(affected > 0)
    }

    // ── Logs ────────────────────────────────────────────────────────

    async fn append_log(&self, entry: &LogEntry) -> Result<(), DatabaseError> {
        let details = entry
            .details
            .as_ref()
            .map(|d| d.to_string());
        self.conn()
            .execute(
                "INSERT INTO import_logs (id, job_id, seq, timestamp, level, step, message, details)
                 VALUES (?1, ?2,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM import_logs WHERE job_id = ?2),
                     ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id.to_string(),
                    entry.job_id.to_string(),
                    entry.timestamp.to_rfc3339(),
                    entry.level.as_str(),
                    entry.step.clone(),
                    entry.message.clone(),
                    opt_text_owned(details),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_log: {e}")))?;
        Ok(())
    }

    async fn list_logs(&self, job_id: Uuid, limit: usize) -> Result<Vec<LogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, job_id, timestamp, level, step, message, details
                 FROM import_logs WHERE job_id = ?1 ORDER BY seq DESC LIMIT ?2",
                params![job_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_logs: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            entries.push(
                row_to_log(&row).map_err(|e| DatabaseError::Query(format!("list_logs: {e}")))?,
            );
        }
        Ok(entries)
    }

    // ── Inconsistencies ─────────────────────────────────────────────

    async fn record_inconsistencies(
        &self,
        job_id: Uuid,
        items: &[Inconsistency],
    ) -> Result<usize, DatabaseError> {
        let mut added = 0;
        for item in items {
            added += self
                .conn()
                .execute(
                    "INSERT OR IGNORE INTO job_inconsistencies
                         (job_id, kind, referenced_by, reference_id, message, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        job_id.to_string(),
                        item.kind.as_str(),
                        item.referenced_by.as_str(),
                        item.reference_id.clone(),
                        item.message.clone(),
                        item.recorded_at.to_rfc3339(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("record_inconsistencies: {e}")))?
                as usize;
        }
        if added > 0 {
            debug!(job_id = %job_id, added, "Recorded import inconsistencies");
        }
        Ok(added)
    }

    async fn list_inconsistencies(
        &self,
        job_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Inconsistency>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT job_id, kind, referenced_by, reference_id, message, recorded_at
                 FROM job_inconsistencies WHERE job_id = ?1
                 ORDER BY recorded_at DESC, rowid DESC LIMIT ?2",
                params![job_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_inconsistencies: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            items.push(
                row_to_inconsistency(&row)
                    .map_err(|e| DatabaseError::Query(format!("list_inconsistencies: {e}")))?,
            );
        }
        Ok(items)
    }

    async fn count_inconsistencies(
        &self,
        job_id: Uuid,
    ) -> Result<BTreeMap<InconsistencyKind, u64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT kind, COUNT(*) FROM job_inconsistencies WHERE job_id = ?1 GROUP BY kind",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_inconsistencies: {e}")))?;

        let mut counts = BTreeMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let kind: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("count_inconsistencies: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("count_inconsistencies: {e}")))?;
            let kind = kind.parse().map_err(DatabaseError::Serialization)?;
            counts.insert(kind, count as u64);
        }
        Ok(counts)
    }
}

// ── CatalogSink ─────────────────────────────────────────────────────

#[async_trait]
impl CatalogSink for LibSqlBackend {
    async fn upsert_record(
        &self,
        kind: RecordKind,
        external_id: &str,
        payload: &serde_json::Value,
        job_id: Option<Uuid>,
    ) -> Result<bool, DatabaseError> {
        let existed = self.get_record(kind, external_id).await?.is_some();
        self.conn()
            .execute(
                "INSERT INTO catalog_records (kind, external_id, payload, imported_by, imported_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(kind, external_id) DO UPDATE SET
                     payload = excluded.payload,
                     imported_by = excluded.imported_by,
                     imported_at = excluded.imported_at",
                params![
                    kind.as_str(),
                    external_id,
                    payload.to_string(),
                    opt_text_owned(job_id.map(|id| id.to_string())),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_record: {e}")))?;
        Ok(!existed)
    }

    async fn get_record(
        &self,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<Option<CatalogRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT kind, external_id, payload, imported_by, imported_at
                 FROM catalog_records WHERE kind = ?1 AND external_id = ?2",
                params![kind.as_str(), external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row_to_record(&row).map_err(|e| DatabaseError::Query(format!("get_record: {e}")))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_record: {e}"))),
        }
    }

    async fn delete_records(&self, kind: RecordKind) -> Result<usize, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM catalog_records WHERE kind = ?1",
                params![kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_records: {e}")))?;
        Ok(affected as usize)
    }

    async fn count_records(&self, kind: RecordKind) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM catalog_records WHERE kind = ?1",
                params![kind.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_records: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_records: {e}"))),
        }
    }

    async fn missing_references(
        &self,
        from: RecordKind,
        reference_field: &str,
        target: RecordKind,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn();

        let mut known = HashSet::new();
        let mut rows = conn
            .query(
                "SELECT external_id FROM catalog_records WHERE kind = ?1",
                params![target.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("missing_references: {e}")))?;
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row.get(0).unwrap_or_default();
            known.insert(id);
        }

        let mut rows = conn
            .query(
                "SELECT payload FROM catalog_records WHERE kind = ?1 ORDER BY external_id",
                params![from.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("missing_references: {e}")))?;

        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        while let Ok(Some(row)) = rows.next().await {
            let raw: String = row.get(0).unwrap_or_default();
            let Ok(payload) = serde_json::from_str::<serde_json::Value>(&raw) else {
                continue;
            };
            let mut ids = Vec::new();
            if let Some(field) = payload.get(reference_field) {
                reference_ids(field, &mut ids);
            }
            for id in ids {
                if !known.contains(&id) && seen.insert(id.clone()) {
                    missing.push(id);
                }
            }
        }
        Ok(missing)
    }

    async fn ensure_unit(
        &self,
        name: &str,
        abbreviation: Option<&str>,
    ) -> Result<String, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT id FROM units WHERE name = ?1", params![name])
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_unit: {e}")))?;

        if let Ok(Some(row)) = rows.next().await {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("ensure_unit: {e}")))?;
            if let Some(abbreviation) = abbreviation {
                conn.execute(
                    "UPDATE units SET abbreviation = ?2 WHERE id = ?1",
                    params![id.clone(), abbreviation],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("ensure_unit: {e}")))?;
            }
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO units (id, name, abbreviation, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.clone(), name, opt_text(abbreviation), Utc::now().to_rfc3339()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("ensure_unit: {e}")))?;
        info!(unit = %name, "Default unit created");
        Ok(id)
    }

    async fn refresh_statistics(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        conn.execute("DELETE FROM catalog_statistics", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("refresh_statistics: {e}")))?;
        let refreshed = conn
            .execute(
                "INSERT INTO catalog_statistics (kind, record_count, refreshed_at)
                 SELECT kind, COUNT(*), ?1 FROM catalog_records GROUP BY kind",
                params![Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("refresh_statistics: {e}")))?;
        Ok(refreshed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepToggles;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    // ── Job tests ───────────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_get_job() {
        let db = test_db().await;
        let job = db.create_job("admin", ImportConfig::default()).await.unwrap();

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.owner, "admin");
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.config, ImportConfig::default());
        assert!(fetched.completed_at.is_none());
    }

    #[tokio::test]
    async fn create_rejects_invalid_config() {
        let db = test_db().await;
        let config = ImportConfig {
            steps: StepToggles::none(),
            ..ImportConfig::default()
        };
        let err = db.create_job("admin", config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(db.list_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_missing_job() {
        let db = test_db().await;
        assert!(db.get_job(Uuid::new_v4()).await.unwrap().is_none());
        assert!(db.get_status(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_lifecycle_is_idempotent() {
        let db = test_db().await;
        let job = db.create_job("admin", ImportConfig::default()).await.unwrap();
        assert!(db.mark_running(job.id, 4).await.unwrap());

        assert!(db.mark_completed(job.id).await.unwrap());
        let first = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        let completed_at = first.completed_at.unwrap();
        assert!(completed_at >= first.started_at);

        assert!(!db.mark_completed(job.id).await.unwrap());
        let second = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(second.completed_at, Some(completed_at));
    }

    #[tokio::test]
    async fn terminal_record_is_frozen() {
        let db = test_db().await;
        let job = db.create_job("admin", ImportConfig::default()).await.unwrap();
        db.mark_running(job.id, 3).await.unwrap();
        db.update_progress(job.id, "Source import", 40, Some(1))
            .await
            .unwrap();
        assert!(db.mark_cancelled(job.id).await.unwrap());

        db.update_progress(job.id, "Author import", 90, Some(2))
            .await
            .unwrap();
        db.record_step_statistics(job.id, "author_import", &StepStatistics::default())
            .await
            .unwrap();
        assert!(!db.mark_failed(job.id, "late", "late").await.unwrap());
        assert!(!db.mark_completed(job.id).await.unwrap());
        assert!(!db.set_status(job.id, JobStatus::Running).await.unwrap());

        let job = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.current_step, "Source import");
        assert_eq!(job.completed_steps, 1);
        assert!(job.statistics.is_empty());
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn progress_is_monotonic_within_a_step() {
        let db = test_db().await;
        let job = db.create_job("admin", ImportConfig::default()).await.unwrap();
        db.mark_running(job.id, 2).await.unwrap();

        db.update_progress(job.id, "Source import", 0, Some(0))
            .await
            .unwrap();
        db.update_progress(job.id, "Source import", 60, None)
            .await
            .unwrap();
        db.update_progress(job.id, "Source import", 30, None)
            .await
            .unwrap();
        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.current_step_progress, 60);

        // A new step resets the floor.
        db.update_progress(job.id, "Author import", 0, Some(1))
            .await
            .unwrap();
        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.current_step_progress, 0);
        assert_eq!(fetched.completed_steps, 1);

        // completed_steps never moves backwards and percent is clamped.
        db.update_progress(job.id, "Author import", 250, Some(0))
            .await
            .unwrap();
        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.completed_steps, 1);
        assert_eq!(fetched.current_step_progress, 100);
    }

    #[tokio::test]
    async fn pause_and_resume_follow_state_machine() {
        let db = test_db().await;
        let job = db.create_job("admin", ImportConfig::default()).await.unwrap();

        // Pending cannot be paused.
        assert!(!db.set_status(job.id, JobStatus::Paused).await.unwrap());

        db.mark_running(job.id, 2).await.unwrap();
        assert!(db.set_status(job.id, JobStatus::Paused).await.unwrap());
        assert_eq!(
            db.get_status(job.id).await.unwrap(),
            Some(JobStatus::Paused)
        );
        assert!(db.set_status(job.id, JobStatus::Running).await.unwrap());
        assert_eq!(
            db.get_status(job.id).await.unwrap(),
            Some(JobStatus::Running)
        );
    }

    #[tokio::test]
    async fn only_pending_jobs_can_be_started() {
        let db = test_db().await;
        let job = db.create_job("admin", ImportConfig::default()).await.unwrap();

        // Resuming is not a way to start a job.
        assert!(!db.set_status(job.id, JobStatus::Running).await.unwrap());
        assert!(db.mark_running(job.id, 2).await.unwrap());
        assert!(!db.mark_running(job.id, 2).await.unwrap());

        assert!(db.set_status(job.id, JobStatus::Paused).await.unwrap());
        assert!(!db.mark_running(job.id, 2).await.unwrap());
        assert_eq!(db.get_status(job.id).await.unwrap(), Some(JobStatus::Paused));

        // The worker may still finish a job paused after its last step.
        assert!(db.mark_completed(job.id).await.unwrap());
        assert!(!db.set_status(job.id, JobStatus::Running).await.unwrap());
    }

    #[test]
    fn settle_guards_follow_transition_table() {
        assert_eq!(sources_of(JobStatus::Completed), "'running', 'paused'");
        assert_eq!(
            sources_of(JobStatus::Cancelled),
            "'pending', 'running', 'paused'"
        );
        assert_eq!(sources_of(JobStatus::Failed), "'pending', 'running', 'paused'");
    }

    #[tokio::test]
    async fn inconsistencies_are_kept_once_per_reference() {
        let db = test_db().await;
        let job = db.create_job("admin", ImportConfig::default()).await.unwrap();
        let other = db.create_job("admin", ImportConfig::default()).await.unwrap();

        let items = vec![
            Inconsistency::new(
                job.id,
                InconsistencyKind::PublicationNotFound,
                RecordKind::Statement,
                "P-1",
            ),
            Inconsistency::new(
                job.id,
                InconsistencyKind::PublicationNotFound,
                RecordKind::Fee,
                "P-2",
            ),
            Inconsistency::new(
                job.id,
                InconsistencyKind::AuthorNotFound,
                RecordKind::Publication,
                "A-1",
            ),
        ];
        assert_eq!(db.record_inconsistencies(job.id, &items).await.unwrap(), 3);
        // The same missing publication seen again by another pass.
        assert_eq!(db.record_inconsistencies(job.id, &items[..1]).await.unwrap(), 0);

        let counts = db.count_inconsistencies(job.id).await.unwrap();
        assert_eq!(counts[&InconsistencyKind::PublicationNotFound], 2);
        assert_eq!(counts[&InconsistencyKind::AuthorNotFound], 1);

        let listed = db.list_inconsistencies(job.id, 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|i| i.job_id == job.id));
        let all = db.list_inconsistencies(job.id, 10).await.unwrap();
        assert!(all.iter().any(|i| i.reference_id == "P-2" && i.referenced_by == RecordKind::Fee));

        assert!(db.count_inconsistencies(other.id).await.unwrap().is_empty());
        assert!(db.list_inconsistencies(other.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_status_on_missing_job_is_not_found() {
        let db = test_db().await;
        let err = db
            .set_status(Uuid::new_v4(), JobStatus::Paused)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn failure_keeps_message_and_trace() {
        let db = test_db().await;
        let job = db.create_job("admin", ImportConfig::default()).await.unwrap();
        db.mark_running(job.id, 1).await.unwrap();
        assert!(
            db.mark_failed(job.id, "boom", "boom\n  caused by: io")
                .await
                .unwrap()
        );
        assert!(!db.mark_failed(job.id, "second", "second").await.unwrap());

        let job = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert_eq!(job.error_trace.as_deref(), Some("boom\n  caused by: io"));
    }

    #[tokio::test]
    async fn progress_data_and_statistics_round_trip() {
        let db = test_db().await;
        let job = db.create_job("admin", ImportConfig::default()).await.unwrap();
        db.mark_running(job.id, 1).await.unwrap();

        let progress = StepProgress {
            processed: 5,
            total: 10,
            progress: 50,
            message: "halfway".into(),
            errors: 1,
        };
        db.record_step_progress(job.id, "source_import", &progress)
            .await
            .unwrap();
        let stats = StepStatistics {
            processed: 10,
            errors: 1,
            elapsed_ms: 1200,
            skipped: false,
        };
        db.record_step_statistics(job.id, "source_import", &stats)
            .await
            .unwrap();

        let job = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.progress_data.steps["source_import"], progress);
        assert_eq!(job.statistics["source_import"], stats);
    }

    #[tokio::test]
    async fn step_progress_on_missing_job_is_not_found() {
        let db = test_db().await;
        let err = db
            .record_step_progress(Uuid::new_v4(), "x", &StepProgress::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_jobs_most_recent_first() {
        let db = test_db().await;
        let first = db.create_job("a", ImportConfig::default()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = db.create_job("b", ImportConfig::default()).await.unwrap();

        let jobs = db.list_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, second.id);
        assert_eq!(jobs[1].id, first.id);
        assert_eq!(db.list_jobs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn logs_come_back_newest_first() {
        let db = test_db().await;
        let job = db.create_job("admin", ImportConfig::default()).await.unwrap();
        for i in 0..3 {
            db.append_log(&LogEntry::new(
                job.id,
                LogLevel::Info,
                "Start",
                format!("entry {i}"),
            ))
            .await
            .unwrap();
        }
        db.append_log(
            &LogEntry::new(job.id, LogLevel::Critical, "Authorization check", "denied")
                .with_details(serde_json::json!({"status": 403})),
        )
        .await
        .unwrap();

        let logs = db.list_logs(job.id, 2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "denied");
        assert_eq!(logs[0].level, LogLevel::Critical);
        assert_eq!(logs[0].details, Some(serde_json::json!({"status": 403})));
        assert_eq!(logs[1].message, "entry 2");
    }

    #[tokio::test]
    async fn on_disk_database_persists_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("catalog.db");

        let id = {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.create_job("admin", ImportConfig::default())
                .await
                .unwrap()
                .id
        };

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_job(id).await.unwrap().is_some());
    }

    // ── Catalog tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_reports_new_records() {
        let db = test_db().await;
        let job_id = Uuid::new_v4();
        let payload = serde_json::json!({"id": "J1", "title": "Journal"});

        assert!(
            db.upsert_record(RecordKind::Source, "J1", &payload, Some(job_id))
                .await
                .unwrap()
        );
        let updated = serde_json::json!({"id": "J1", "title": "Renamed"});
        assert!(
            !db.upsert_record(RecordKind::Source, "J1", &updated, None)
                .await
                .unwrap()
        );

        let record = db.get_record(RecordKind::Source, "J1").await.unwrap().unwrap();
        assert_eq!(record.payload["title"], "Renamed");
        assert!(record.imported_by.is_none());
        assert_eq!(db.count_records(RecordKind::Source).await.unwrap(), 1);
        assert_eq!(db.count_records(RecordKind::Author).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_records_only_touches_one_kind() {
        let db = test_db().await;
        for id in ["P1", "P2"] {
            db.upsert_record(RecordKind::Publication, id, &serde_json::json!({}), None)
                .await
                .unwrap();
        }
        db.upsert_record(RecordKind::Author, "A1", &serde_json::json!({}), None)
            .await
            .unwrap();

        assert_eq!(db.delete_records(RecordKind::Publication).await.unwrap(), 2);
        assert_eq!(db.count_records(RecordKind::Publication).await.unwrap(), 0);
        assert_eq!(db.count_records(RecordKind::Author).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_references_lists_unknown_ids_once() {
        let db = test_db().await;
        db.upsert_record(
            RecordKind::Statement,
            "S1",
            &serde_json::json!({"publicationId": "P1"}),
            None,
        )
        .await
        .unwrap();
        db.upsert_record(
            RecordKind::Statement,
            "S2",
            &serde_json::json!({"publicationId": ["P2", "P1", {"id": "P3"}]}),
            None,
        )
        .await
        .unwrap();
        db.upsert_record(RecordKind::Publication, "P2", &serde_json::json!({}), None)
            .await
            .unwrap();

        let missing = db
            .missing_references(RecordKind::Statement, "publicationId", RecordKind::Publication)
            .await
            .unwrap();
        assert_eq!(missing, vec!["P1".to_string(), "P3".to_string()]);
    }

    #[tokio::test]
    async fn ensure_unit_is_idempotent() {
        let db = test_db().await;
        let first = db.ensure_unit("Default Faculty", None).await.unwrap();
        let second = db.ensure_unit("Default Faculty", Some("DF")).await.unwrap();
        assert_eq!(first, second);
        let other = db.ensure_unit("Other", None).await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn refresh_statistics_counts_per_kind() {
        let db = test_db().await;
        db.upsert_record(RecordKind::Author, "A1", &serde_json::json!({}), None)
            .await
            .unwrap();
        db.upsert_record(RecordKind::Author, "A2", &serde_json::json!({}), None)
            .await
            .unwrap();
        db.upsert_record(RecordKind::Source, "J1", &serde_json::json!({}), None)
            .await
            .unwrap();

        assert_eq!(db.refresh_statistics().await.unwrap(), 2);
        let stats = db.catalog_statistics().await.unwrap();
        assert_eq!(stats["author"], 2);
        assert_eq!(stats["source"], 1);
    }
}
