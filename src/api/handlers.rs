//! Request handlers for the job submission API.

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ApiError, AppState};
use crate::error::JobFailure;
use crate::scheduler::{
    validate_source_ref, Job, JobOutcome, JobState, StatusReport, TaskKey,
};

/// How a prediction request is served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Wait for every result and return them in the response.
    #[default]
    Sync,
    /// Enqueue on the durable queue and return immediately.
    Queued,
}

/// Body of `POST /predict`.
///
/// `audioUrl` is the single-reference form and is merged into `sourceRefs`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictRequest {
    #[serde(default)]
    pub source_refs: Vec<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub mode: SubmitMode,
}

impl PredictRequest {
    fn into_source_refs(self) -> Result<Vec<String>, ApiError> {
        let mut refs = self.source_refs;
        if let Some(url) = self.audio_url {
            refs.push(url);
        }
        if refs.is_empty() {
            return Err(ApiError::BadRequest(
                "sourceRefs or audioUrl is required".to_string(),
            ));
        }
        for source_ref in &refs {
            validate_source_ref(source_ref)?;
        }
        Ok(refs.into_iter().map(|r| r.trim().to_string()).collect())
    }
}

/// One reference's outcome in a synchronous response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictionEntry {
    source_ref: String,
    task_key: TaskKey,
    state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<FailureBody>,
}

#[derive(Debug, Serialize)]
struct FailureBody {
    kind: &'static str,
    message: String,
}

impl From<&JobFailure> for FailureBody {
    fn from(failure: &JobFailure) -> Self {
        Self {
            kind: failure.kind(),
            message: failure.to_string(),
        }
    }
}

impl PredictionEntry {
    fn new(source_ref: String, outcome: &JobOutcome) -> Self {
        let task_key = TaskKey::from_source(&source_ref);
        let state = JobState::from_outcome(outcome);
        match outcome {
            Ok(result) => Self {
                source_ref,
                task_key,
                state,
                result: Some(result.flattened()),
                failure: None,
            },
            Err(failure) => Self {
                source_ref,
                task_key,
                state,
                result: None,
                failure: Some(failure.into()),
            },
        }
    }
}

/// Acknowledgement for one enqueued reference.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuedEntry {
    task_key: TaskKey,
    job_id: uuid::Uuid,
    source_ref: String,
}

/// `POST /predict`
pub async fn predict(
    State(state): State<AppState>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let mode = request.mode;
    let source_refs = request.into_source_refs()?;

    match mode {
        SubmitMode::Sync => {
            tracing::info!(count = source_refs.len(), "Running synchronous prediction");
            let outcomes = state.dispatcher.submit_batch(&source_refs).await;
            let results: Vec<PredictionEntry> = outcomes
                .into_iter()
                .map(|(source_ref, outcome)| PredictionEntry::new(source_ref, &outcome))
                .collect();
            Ok((StatusCode::OK, Json(json!({ "results": results }))).into_response())
        }
        SubmitMode::Queued => {
            let mut jobs = Vec::with_capacity(source_refs.len());
            for source_ref in source_refs {
                let job = Job::new(source_ref);
                state.queue.enqueue(&job).await?;
                tracing::info!(job_id = %job.id, task_key = %job.task_key(), "Job enqueued");
                jobs.push(QueuedEntry {
                    task_key: job.task_key(),
                    job_id: job.id,
                    source_ref: job.source_ref,
                });
            }
            Ok((StatusCode::ACCEPTED, Json(json!({ "jobs": jobs }))).into_response())
        }
    }
}

/// Query of `GET /status`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub task_key: Option<String>,
    pub source_ref: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    task_key: TaskKey,
    state: JobState,
    result: Option<serde_json::Map<String, serde_json::Value>>,
    failure: Option<FailureBody>,
}

impl From<StatusReport> for StatusBody {
    fn from(report: StatusReport) -> Self {
        Self {
            task_key: report.task_key,
            state: report.state,
            result: report.result.as_ref().map(|r| r.flattened()),
            failure: report.failure.as_ref().map(FailureBody::from),
        }
    }
}

/// `GET /status`
pub async fn status(
    State(state): State<AppState>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(query) = query?;

    let key = match (query.task_key, query.source_ref) {
        (Some(raw), _) => TaskKey::parse(raw.trim())
            .ok_or_else(|| ApiError::BadRequest(format!("malformed task key '{}'", raw)))?,
        (None, Some(source_ref)) if !source_ref.trim().is_empty() => {
            TaskKey::from_source(&source_ref)
        }
        _ => {
            return Err(ApiError::BadRequest(
                "taskKey or sourceRef is required".to_string(),
            ))
        }
    };

    let report = state
        .dispatcher
        .status(&key)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("unknown task key '{}'", key)))?;

    Ok(Json(json!(StatusBody::from(report))))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let queue = match state.queue.stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::warn!(error = %e, "Queue stats unavailable for health check");
            None
        }
    };

    Json(json!({
        "status": if queue.is_some() { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "dispatcher": state.dispatcher.stats(),
        "queue": queue,
    }))
}
