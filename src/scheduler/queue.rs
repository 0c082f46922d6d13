//! Durable job queue with reliable dequeue.
//!
//! This module provides the queue the coordinator consumes jobs from and
//! publishes completed results to:
//!
//! - Atomic dequeue using BRPOPLPUSH
//! - Recovery of jobs orphaned by a crashed coordinator
//! - Output list of completion records for downstream consumers
//! - Per-task-key job state for status queries
//!
//! # Queue Structure
//!
//! The Redis implementation uses three lists and one key family:
//!
//! - `{queue_name}:pending`: Jobs waiting to be dispatched
//! - `{queue_name}:processing`: Jobs taken by a coordinator (for crash recovery)
//! - `{queue_name}:completed`: Completion records for downstream consumers
//! - `{queue_name}:state:{task_key}`: Last known job state (7 day expiry)
//!
//! `MemoryJobQueue` implements the same contract in process, for tests and
//! one-shot runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use super::job::{CompletionRecord, Job, JobState, TaskKey};
use crate::error::JobFailure;

/// Number of restart recoveries after which an orphaned job is failed.
pub const MAX_RECOVERIES: u32 = 3;

/// Expiry of job state keys, in seconds (7 days).
const STATE_TTL_SECS: u64 = 604_800;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The store rejected the write.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// Contract of the durable queue shared by coordinators.
///
/// All writes are keyed by task key or job id, so repeating them is harmless.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Adds a job to the pending list and records it as queued.
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;

    /// Takes the oldest pending job, waiting up to `timeout` for one.
    ///
    /// The job stays in the processing list until `ack` is called.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError>;

    /// Removes a resolved job from the processing list.
    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Appends a completion record to the output list.
    async fn publish(&self, record: &CompletionRecord) -> Result<(), QueueError>;

    /// Records the state of a task key.
    async fn set_state(&self, key: &TaskKey, state: JobState) -> Result<(), QueueError>;

    /// Returns the last recorded state of a task key.
    async fn state(&self, key: &TaskKey) -> Result<Option<JobState>, QueueError>;

    /// Moves jobs orphaned in the processing list back to pending.
    ///
    /// Returns the number of jobs requeued. Jobs recovered more than
    /// `MAX_RECOVERIES` times are failed and published instead.
    ///
    /// The processing list is shared by every coordinator using this queue
    /// name. Call this only at startup, with no other intake consuming the
    /// same queue, or jobs still running elsewhere are requeued.
    async fn recover_processing_jobs(&self) -> Result<usize, QueueError>;

    /// Returns the most recent completion records, newest first.
    async fn completed(&self, limit: usize) -> Result<Vec<CompletionRecord>, QueueError>;

    /// Returns queue statistics.
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Failure published for a job orphaned too many times.
fn recovery_exhausted(job: &Job) -> CompletionRecord {
    CompletionRecord::failure(job.task_key(), JobFailure::WorkerCrashed { exit_code: None })
}

/// Redis-backed durable queue.
///
/// The queue uses BRPOPLPUSH for atomic dequeue operations, ensuring that
/// jobs are not lost if a coordinator crashes during processing.
pub struct RedisJobQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Prefix shared by every key of this queue.
    queue_name: String,
    /// Name of the pending list.
    pending_queue: String,
    /// Name of the processing list.
    processing_queue: String,
    /// Name of the output list.
    completed_queue: String,
}

impl RedisJobQueue {
    /// Connects to Redis and creates a new job queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - Name of the queue (used as prefix for Redis keys)
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a queue from an existing ConnectionManager.
    ///
    /// Useful when sharing the connection with the result cache.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            pending_queue: format!("{}:pending", queue_name),
            processing_queue: format!("{}:processing", queue_name),
            completed_queue: format!("{}:completed", queue_name),
        }
    }

    fn state_key(&self, key: &TaskKey) -> String {
        format!("{}:state:{}", self.queue_name, key)
    }

    /// Helper to remove a job from the processing queue by ID.
    async fn remove_job_from_processing(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let jobs: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for job_data in jobs {
            if let Ok(job) = serde_json::from_str::<Job>(&job_data) {
                if job.id == job_id {
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &job_data)
                        .await?;
                    return Ok(());
                }
            }
        }

        // Job not found is not an error - it might have been already removed
        Ok(())
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl DurableQueue for RedisJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        // LPUSH here and RPOP in dequeue keeps FIFO order
        conn.lpush::<_, _, ()>(&self.pending_queue, serialized)
            .await?;
        self.set_state(&job.task_key(), JobState::Queued).await
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.pending_queue)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => {
                let job: Job = serde_json::from_str(&data)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.remove_job_from_processing(job_id).await
    }

    async fn publish(&self, record: &CompletionRecord) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(record)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.completed_queue, serialized)
            .await?;
        self.set_state(&record.task_key, record.state).await
    }

    async fn set_state(&self, key: &TaskKey, state: JobState) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(&state)?;
        redis::cmd("SET")
            .arg(self.state_key(key))
            .arg(serialized)
            .arg("EX")
            .arg(STATE_TTL_SECS)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn state(&self, key: &TaskKey) -> Result<Option<JobState>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.state_key(key)).await?;

        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn recover_processing_jobs(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let mut recovered = 0;

        let jobs: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for job_data in jobs {
            let Ok(mut job) = serde_json::from_str::<Job>(&job_data) else {
                continue;
            };
            job.recoveries += 1;

            if job.recoveries <= MAX_RECOVERIES {
                let serialized = serde_json::to_string(&job)?;

                // Atomically remove from processing and put back at the head
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .lrem(&self.processing_queue, 1, &job_data)
                    .rpush(&self.pending_queue, &serialized);
                pipe.query_async::<_, ()>(&mut conn).await?;

                recovered += 1;
            } else {
                conn.lrem::<_, _, ()>(&self.processing_queue, 1, &job_data)
                    .await?;
                self.publish(&recovery_exhausted(&job)).await?;
            }
        }

        Ok(recovered)
    }

    async fn completed(&self, limit: usize) -> Result<Vec<CompletionRecord>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.completed_queue, 0, limit as isize - 1)
            .await?;

        let records: Result<Vec<CompletionRecord>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();

        Ok(records?)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.llen(&self.pending_queue)
            .llen(&self.processing_queue)
            .llen(&self.completed_queue);
        let (pending, processing, completed): (usize, usize, usize) =
            pipe.query_async(&mut conn).await?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_jobs: pending,
            processing_jobs: processing,
            completed_records: completed,
        })
    }
}

#[derive(Default)]
struct MemoryQueueState {
    pending: VecDeque<Job>,
    processing: Vec<Job>,
    completed: VecDeque<CompletionRecord>,
    states: HashMap<TaskKey, JobState>,
}

/// In-process queue with the same contract as `RedisJobQueue`.
///
/// Nothing survives the process; used by tests and the one-shot `predict`
/// command.
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<MemoryQueueState>,
    job_ready: Notify,
    failing_publishes: AtomicU32,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail, to exercise persistence retries.
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Returns the jobs currently held in the processing list.
    pub async fn processing_jobs(&self) -> Vec<Job> {
        self.state.lock().await.processing.clone()
    }

    /// Puts a job straight into the processing list, as a crashed
    /// coordinator would have left it.
    pub async fn orphan(&self, job: Job) {
        self.state.lock().await.processing.push(job);
    }
}

#[async_trait]
impl DurableQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.states.insert(job.task_key(), JobState::Queued);
        state.pending.push_back(job.clone());
        drop(state);
        self.job_ready.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent enqueue is not missed
            let notified = self.job_ready.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(job) = state.pending.pop_front() {
                    state.processing.push(job.clone());
                    return Ok(Some(job));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(pos) = state.processing.iter().position(|job| job.id == job_id) {
            state.processing.remove(pos);
        }
        Ok(())
    }

    async fn publish(&self, record: &CompletionRecord) -> Result<(), QueueError> {
        let failing = self.failing_publishes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_publishes.store(failing - 1, Ordering::SeqCst);
            return Err(QueueError::Unavailable("injected publish failure".into()));
        }

        let mut state = self.state.lock().await;
        state.states.insert(record.task_key.clone(), record.state);
        state.completed.push_front(record.clone());
        Ok(())
    }

    async fn set_state(&self, key: &TaskKey, job_state: JobState) -> Result<(), QueueError> {
        self.state.lock().await.states.insert(key.clone(), job_state);
        Ok(())
    }

    async fn state(&self, key: &TaskKey) -> Result<Option<JobState>, QueueError> {
        Ok(self.state.lock().await.states.get(key).copied())
    }

    async fn recover_processing_jobs(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let orphaned: Vec<Job> = state.processing.drain(..).collect();
        let mut recovered = 0;

        for mut job in orphaned {
            job.recoveries += 1;
            if job.recoveries <= MAX_RECOVERIES {
                state.pending.push_front(job);
                recovered += 1;
            } else {
                let record = recovery_exhausted(&job);
                state.states.insert(record.task_key.clone(), record.state);
                state.completed.push_front(record);
            }
        }
        drop(state);

        if recovered > 0 {
            self.job_ready.notify_one();
        }
        Ok(recovered)
    }

    async fn completed(&self, limit: usize) -> Result<Vec<CompletionRecord>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.completed.iter().take(limit).cloned().collect())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            queue_name: "memory".to_string(),
            pending_jobs: state.pending.len(),
            processing_jobs: state.processing.len(),
            completed_records: state.completed.len(),
        })
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Number of jobs waiting to be dispatched.
    pub pending_jobs: usize,
    /// Number of jobs taken by a coordinator and not yet acknowledged.
    pub processing_jobs: usize,
    /// Number of completion records in the output list.
    pub completed_records: usize,
}

impl QueueStats {
    /// Returns the number of jobs not yet acknowledged.
    pub fn outstanding_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs
    }
}
