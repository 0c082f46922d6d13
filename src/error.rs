//! Error types for mood-forge operations.
//!
//! Defines the job failure taxonomy reported to callers plus the error types
//! of the subsystems the coordinator talks to:
//! - Result cache reads and writes
//! - Worker unit spawning
//! - Feature extraction inside a worker unit
//! - Model inference on the coordinator

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal failure of a submitted job.
///
/// Every dispatch-time failure resolves the job's future with one of these
/// values; none of them escape the dispatcher's own control flow. The type is
/// cloneable because every caller coalesced onto the same task key receives
/// the same outcome.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobFailure {
    /// Malformed submission, rejected before dispatch.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The worker unit could not be started.
    #[error("Worker failed to spawn: {0}")]
    SpawnFailure(String),

    /// Feature extraction reported a caught failure, or the worker broke the
    /// message protocol.
    #[error("Worker reported an error: {0}")]
    WorkerError(String),

    /// The worker exited abnormally without sending a message.
    #[error("Worker crashed (exit code: {exit_code:?})")]
    WorkerCrashed { exit_code: Option<i32> },

    /// The job deadline expired before the worker answered.
    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    /// The inference engine failed for one of the registered models.
    #[error("Inference failed for model '{model}': {reason}")]
    InferenceFailure { model: String, reason: String },

    /// The computed result could not be persisted.
    #[error("Storage failure: {0}")]
    StorageFailure(String),
}

impl JobFailure {
    /// Short machine-readable label, used for metrics and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            JobFailure::InvalidInput(_) => "invalid_input",
            JobFailure::SpawnFailure(_) => "spawn_failure",
            JobFailure::WorkerError(_) => "worker_error",
            JobFailure::WorkerCrashed { .. } => "worker_crashed",
            JobFailure::Timeout(_) => "timeout",
            JobFailure::InferenceFailure { .. } => "inference_failure",
            JobFailure::StorageFailure(_) => "storage_failure",
        }
    }

    /// Returns whether this failure is the deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, JobFailure::Timeout(_))
    }
}

/// Errors that can occur while reading or writing the result cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cache connection failed: {0}")]
    ConnectionFailed(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur when starting a worker unit.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Failed to spawn worker process: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker stdout was not captured")]
    MissingStdout,

    #[error("Spawn failed: {0}")]
    Other(String),
}

/// Errors that can occur while extracting features inside a worker unit.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Failed to fetch '{source_ref}': {reason}")]
    FetchFailed { source_ref: String, reason: String },

    #[error("Unsupported source reference: {0}")]
    UnsupportedSource(String),

    #[error("Audio decoding failed: {0}")]
    DecodeFailed(String),

    #[error("Decoded audio needs {required_mb} MB, limit is {limit_mb} MB")]
    MemoryLimitExceeded { required_mb: u64, limit_mb: u64 },

    #[error("Audio too short for analysis: {samples} samples")]
    TooShort { samples: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during model inference.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Model '{0}' is not loaded")]
    ModelNotLoaded(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Inference API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse inference response: {0}")]
    ParseError(String),

    #[error("Model '{0}' returned no prediction rows")]
    EmptyPredictions(String),
}
