//! Job definitions for the scheduler.
//!
//! This module defines the core data types shared by the dispatcher, the
//! durable queue and the API:
//!
//! - `TaskKey`: deduplication key derived from a source reference
//! - `Job`: a unit of work, one source reference to analyse
//! - `JobState`: lifecycle state of a job
//! - `WorkResult`: immutable per-job output
//! - `CompletionRecord`: what gets published to the output queue
//! - `StatusReport`: answer to a status query

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobFailure;

/// Prefix of every task key, shared with the result cache key layout.
pub const TASK_KEY_PREFIX: &str = "task:";

/// Schemes a source reference may use.
const ALLOWED_SCHEMES: &[&str] = &["http", "https", "file"];

/// Deduplication identifier derived deterministically from a source reference.
///
/// Two submissions of the same reference map to the same key, which is also
/// the key the result is cached under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    /// Derives the task key for a source reference.
    pub fn from_source(source_ref: &str) -> Self {
        Self(format!("{}{}", TASK_KEY_PREFIX, source_ref.trim()))
    }

    /// Parses an existing key string, accepting only well-formed keys.
    pub fn parse(raw: &str) -> Option<Self> {
        let source = raw.strip_prefix(TASK_KEY_PREFIX)?;
        if source.trim().is_empty() {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    /// Returns the source reference this key was derived from.
    pub fn source_ref(&self) -> &str {
        &self.0[TASK_KEY_PREFIX.len()..]
    }

    /// Get the key string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checks that a source reference can be handed to a worker unit.
///
/// # Errors
///
/// Returns `JobFailure::InvalidInput` for empty references, references that
/// are not URLs, and URLs with a scheme the worker cannot fetch.
pub fn validate_source_ref(source_ref: &str) -> Result<(), JobFailure> {
    let trimmed = source_ref.trim();
    if trimmed.is_empty() {
        return Err(JobFailure::InvalidInput(
            "source reference cannot be empty".to_string(),
        ));
    }

    let url = reqwest::Url::parse(trimmed).map_err(|e| {
        JobFailure::InvalidInput(format!("'{}' is not a valid URL: {}", trimmed, e))
    })?;

    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(JobFailure::InvalidInput(format!(
            "unsupported scheme '{}' in '{}'",
            url.scheme(),
            trimmed
        )));
    }

    Ok(())
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a concurrency slot.
    Queued,
    /// A worker unit is running for this job.
    Active,
    /// Result computed and persisted.
    Completed,
    /// Job failed with a classified reason.
    Failed,
    /// The worker did not answer before the deadline.
    TimedOut,
}

impl JobState {
    /// Returns whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut
        )
    }

    /// Terminal state for a job outcome.
    pub fn from_outcome(outcome: &Result<WorkResult, JobFailure>) -> Self {
        match outcome {
            Ok(_) => JobState::Completed,
            Err(failure) if failure.is_timeout() => JobState::TimedOut,
            Err(_) => JobState::Failed,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// A job representing one source reference to analyse.
///
/// Jobs are stored in the durable queue and dispatched to worker units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Deterministic identifier derived from the source reference.
    pub id: Uuid,
    /// Reference to the audio to analyse.
    pub source_ref: String,
    /// When this job was submitted.
    pub submitted_at: DateTime<Utc>,
    /// Number of times the job was recovered from an orphaned processing list.
    #[serde(default)]
    pub recoveries: u32,
}

impl Job {
    /// Creates a new job for a source reference.
    pub fn new(source_ref: impl Into<String>) -> Self {
        let source_ref = source_ref.into().trim().to_string();
        Self {
            id: Self::id_for(&source_ref),
            source_ref,
            submitted_at: Utc::now(),
            recoveries: 0,
        }
    }

    /// Job identifier for a source reference.
    pub fn id_for(source_ref: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, source_ref.trim().as_bytes())
    }

    /// Returns the job's task key.
    pub fn task_key(&self) -> TaskKey {
        TaskKey::from_source(&self.source_ref)
    }

    /// Returns how long ago the job was submitted.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.submitted_at
    }
}

/// Scalar metrics computed from the raw audio during extraction.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AuxFeatures {
    pub energy: f64,
    pub loudness: f64,
    pub tempo: f64,
}

/// Final, immutable output of a successful job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    pub task_key: TaskKey,
    /// Reported score per model name.
    pub per_model_score: BTreeMap<String, f64>,
    pub aux_features: AuxFeatures,
    pub computed_at: DateTime<Utc>,
}

impl WorkResult {
    /// Renders the result as one flat JSON object: one field per model plus
    /// `energy`, `loudness` and `tempo`.
    pub fn flattened(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for (model, score) in &self.per_model_score {
            map.insert(model.clone(), serde_json::json!(score));
        }
        map.insert("energy".into(), serde_json::json!(self.aux_features.energy));
        map.insert(
            "loudness".into(),
            serde_json::json!(self.aux_features.loudness),
        );
        map.insert("tempo".into(), serde_json::json!(self.aux_features.tempo));
        map
    }
}

/// Record published to the output queue once per computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub task_key: TaskKey,
    pub state: JobState,
    #[serde(default)]
    pub result: Option<WorkResult>,
    #[serde(default)]
    pub failure: Option<JobFailure>,
    pub completed_at: DateTime<Utc>,
}

impl CompletionRecord {
    /// Creates a record for a successful computation.
    pub fn success(result: WorkResult) -> Self {
        Self {
            task_key: result.task_key.clone(),
            state: JobState::Completed,
            result: Some(result),
            failure: None,
            completed_at: Utc::now(),
        }
    }

    /// Creates a record for a failed computation.
    pub fn failure(task_key: TaskKey, failure: JobFailure) -> Self {
        let state = if failure.is_timeout() {
            JobState::TimedOut
        } else {
            JobState::Failed
        };
        Self {
            task_key,
            state,
            result: None,
            failure: Some(failure),
            completed_at: Utc::now(),
        }
    }
}

/// Answer to a status query for a task key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub task_key: TaskKey,
    pub state: JobState,
    pub result: Option<WorkResult>,
    pub failure: Option<JobFailure>,
}
