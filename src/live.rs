//! Live-update channel for import dashboards.
//!
//! The orchestrator and steps publish `JobEvent`s on a broadcast channel;
//! dashboards subscribe through `/ws/jobs/{job_id}`. Delivery is
//! best-effort: publishing never fails and never blocks the pipeline.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::log::LogEntry;
use crate::job::state::{JobRecord, JobStatus, SubtaskSnapshot};
use crate::store::JobStore;

/// Number of log entries replayed to a freshly connected dashboard.
const REPLAY_LOG_LIMIT: usize = 50;

/// Events streamed while a job runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// Current state of a job, sent on connect and on request.
    Status {
        job_id: Uuid,
        status: JobStatus,
        current_step: String,
        completed_steps: u32,
        total_steps: u32,
        overall_progress: u8,
    },
    /// The pipeline started executing.
    Started {
        job_id: Uuid,
        total_steps: u32,
        steps: Vec<String>,
    },
    /// A step was dispatched.
    StepStarted {
        job_id: Uuid,
        step: String,
        index: u32,
        total: u32,
    },
    /// Coarse progress of the step in flight.
    Progress {
        job_id: Uuid,
        step: String,
        percent: u8,
    },
    /// Fine-grained progress of an inner loop.
    Subtask {
        job_id: Uuid,
        subtask: SubtaskSnapshot,
    },
    /// A step settled.
    StepFinished {
        job_id: Uuid,
        step: String,
        outcome: String,
        error_count: usize,
    },
    /// A log entry was appended.
    Log { entry: LogEntry },
    /// The run reached a terminal status.
    Completion {
        job_id: Uuid,
        status: JobStatus,
        success: bool,
        message: String,
    },
}

impl JobEvent {
    /// Get the job ID from any variant.
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Status { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::StepStarted { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Subtask { job_id, .. }
            | Self::StepFinished { job_id, .. }
            | Self::Completion { job_id, .. } => *job_id,
            Self::Log { entry } => entry.job_id,
        }
    }

    /// Whether this is the final event of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completion { .. })
    }

    /// Snapshot of a job record.
    pub fn status_of(job: &JobRecord) -> Self {
        Self::Status {
            job_id: job.id,
            status: job.status,
            current_step: job.current_step.clone(),
            completed_steps: job.completed_steps,
            total_steps: job.total_steps,
            overall_progress: job.overall_progress(),
        }
    }
}

/// Publisher side of the live channel.
#[derive(Clone)]
pub struct LiveChannel {
    tx: broadcast::Sender<JobEvent>,
}

impl LiveChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

/// Shared state for the live routes.
#[derive(Clone)]
pub struct LiveState {
    pub store: Arc<dyn JobStore>,
    pub live: LiveChannel,
}

/// Requests a dashboard may send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientRequest {
    Ping {
        #[serde(default)]
        timestamp: Option<serde_json::Value>,
    },
    RequestStatus,
    RequestLogs,
}

/// Build the Axum router for `/ws/jobs/{job_id}` and `/api/jobs/{job_id}`.
pub fn live_routes(state: LiveState) -> Router {
    Router::new()
        .route("/ws/jobs/{job_id}", get(ws_handler))
        .route("/api/jobs/{job_id}", get(job_handler))
        .with_state(state)
}

/// Recent inconsistencies included in a job snapshot.
const SNAPSHOT_INCONSISTENCY_LIMIT: usize = 50;

/// JSON view of a job record with its derived progress and the
/// inconsistency ledger (counts per kind plus the most recent entries).
pub async fn job_snapshot(
    store: &dyn JobStore,
    job_id: Uuid,
) -> Result<Option<serde_json::Value>, DatabaseError> {
    let Some(job) = store.get_job(job_id).await? else {
        return Ok(None);
    };
    let counts = store.count_inconsistencies(job_id).await?;
    let recent = store
        .list_inconsistencies(job_id, SNAPSHOT_INCONSISTENCY_LIMIT)
        .await?;

    let overall = job.overall_progress();
    let mut body = serde_json::to_value(&job)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    body["overall_progress"] = serde_json::json!(overall);
    body["inconsistency_counts"] = serde_json::json!(counts);
    body["inconsistencies"] = serde_json::json!(recent);
    Ok(Some(body))
}

async fn job_handler(Path(job_id): Path<Uuid>, State(state): State<LiveState>) -> impl IntoResponse {
    match job_snapshot(state.store.as_ref(), job_id).await {
        Ok(Some(body)) => (StatusCode::OK, Json(body)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Failed to load job");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(job_id): Path<Uuid>,
    State(state): State<LiveState>,
) -> impl IntoResponse {
    info!(job_id = %job_id, "Live WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, job_id, state))
}

async fn send_event(socket: &mut WebSocket, event: &JobEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}

async fn send_status(socket: &mut WebSocket, job_id: Uuid, state: &LiveState) -> bool {
    match state.store.get_job(job_id).await {
        Ok(Some(job)) => send_event(socket, &JobEvent::status_of(&job)).await,
        Ok(None) => true,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Failed to load job status");
            true
        }
    }
}

async fn send_logs(socket: &mut WebSocket, job_id: Uuid, state: &LiveState) -> bool {
    match state.store.list_logs(job_id, REPLAY_LOG_LIMIT).await {
        Ok(mut entries) => {
            entries.reverse();
            for entry in entries {
                if !send_event(socket, &JobEvent::Log { entry }).await {
                    return false;
                }
            }
            true
        }
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Failed to load job log history");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, job_id: Uuid, state: LiveState) {
    // Subscribe before replaying so nothing published in between is lost.
    let mut rx = state.live.subscribe();

    if !send_status(&mut socket, job_id, &state).await || !send_logs(&mut socket, job_id, &state).await {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if event.job_id() != job_id {
                            continue;
                        }
                        if !send_event(&mut socket, &event).await {
                            debug!("Live WS client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Live WS client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Live broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let ok = match serde_json::from_str::<ClientRequest>(text.as_str()) {
                            Ok(ClientRequest::Ping { timestamp }) => {
                                let pong = serde_json::json!({"type": "pong", "timestamp": timestamp});
                                socket.send(Message::Text(pong.to_string().into())).await.is_ok()
                            }
                            Ok(ClientRequest::RequestStatus) => send_status(&mut socket, job_id, &state).await,
                            Ok(ClientRequest::RequestLogs) => send_logs(&mut socket, job_id, &state).await,
                            Err(e) => {
                                debug!(error = %e, "Ignoring unrecognised live WS request");
                                true
                            }
                        };
                        if !ok {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(job_id = %job_id, "Live WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Live WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(job_id = %job_id, "Live WebSocket connection closed");
}
