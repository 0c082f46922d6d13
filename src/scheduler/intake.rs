//! Queue intake: feeds jobs from the durable queue into the dispatcher.
//!
//! A single background loop dequeues pending jobs (reliably, so an orphaned
//! job survives a coordinator crash) and hands each one to the dispatcher.
//!
//! # Features
//!
//! - Backpressure: at most `max_concurrent_workers` jobs are taken from the
//!   queue and unresolved at once, and none while the dispatcher is full
//! - Crash recovery of jobs left in the processing list on start
//! - Acknowledgement once the job resolved, whatever the outcome
//! - Graceful shutdown with broadcast channel
//! - Intake statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::dispatcher::Dispatcher;
use super::job::{CompletionRecord, Job};
use super::queue::{DurableQueue, QueueError};
use crate::error::JobFailure;
use crate::metrics::MetricsCollector;

/// Pause between capacity checks while every slot is taken.
const CAPACITY_POLL: Duration = Duration::from_millis(50);

/// Interval between queue depth metric refreshes.
const DEPTH_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Errors that can occur in queue intake.
#[derive(Debug, Error)]
pub enum IntakeError {
    /// The durable queue failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Intake is already running.
    #[error("Intake is already running")]
    AlreadyRunning,

    /// Intake is not running.
    #[error("Intake is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for queue intake.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// How long a dequeue blocks when the queue is empty.
    pub poll_interval: Duration,
    /// Time allowed for in-flight jobs to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl IntakeConfig {
    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about queue intake.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IntakeStats {
    /// Jobs taken from the queue and not yet resolved.
    pub in_progress: u64,
    /// Total number of jobs completed successfully.
    pub jobs_completed: u64,
    /// Total number of jobs that failed.
    pub jobs_failed: u64,
    /// Average time from dequeue to resolution.
    pub average_job_duration: Duration,
}

impl IntakeStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking intake statistics.
#[derive(Default)]
struct SharedIntakeStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    in_progress: AtomicU64,
}

impl SharedIntakeStats {
    fn record(&self, succeeded: bool, duration: Duration) {
        if succeeded {
            self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_intake_stats(&self) -> IntakeStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        IntakeStats {
            in_progress: self.in_progress.load(Ordering::SeqCst),
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: average_duration,
        }
    }
}

/// Background consumer of the durable queue.
pub struct QueueIntake {
    config: IntakeConfig,
    queue: Arc<dyn DurableQueue>,
    dispatcher: Dispatcher,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<SharedIntakeStats>,
    is_running: AtomicBool,
}

impl QueueIntake {
    pub fn new(config: IntakeConfig, queue: Arc<dyn DurableQueue>, dispatcher: Dispatcher) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            dispatcher,
            shutdown_tx,
            handle: None,
            stats: Arc::new(SharedIntakeStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Recovers orphaned jobs and starts the intake loop.
    ///
    /// # Errors
    ///
    /// Returns `IntakeError::AlreadyRunning` if intake is already running.
    pub async fn start(&mut self) -> Result<(), IntakeError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(IntakeError::AlreadyRunning);
        }

        // Recover any jobs stuck in the processing list from previous runs
        match self.queue.recover_processing_jobs().await {
            Ok(recovered) => {
                if recovered > 0 {
                    info!(recovered = recovered, "Recovered jobs from processing queue");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to recover processing jobs");
            }
        }

        let intake_loop = IntakeLoop {
            queue: Arc::clone(&self.queue),
            dispatcher: self.dispatcher.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            poll_interval: self.config.poll_interval,
            slots: Arc::new(Semaphore::new(
                self.dispatcher.settings().max_concurrent_workers,
            )),
            stats: Arc::clone(&self.stats),
            metrics: MetricsCollector::new(),
        };

        self.handle = Some(tokio::spawn(intake_loop.run()));
        self.is_running.store(true, Ordering::SeqCst);
        info!("Queue intake started");

        Ok(())
    }

    /// Stops taking new jobs and waits for the taken ones to resolve.
    ///
    /// # Errors
    ///
    /// Returns `IntakeError::ShutdownTimeout` if in-flight jobs do not
    /// resolve in time; they stay in the processing list and are recovered
    /// on the next start.
    pub async fn shutdown(&mut self) -> Result<(), IntakeError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(IntakeError::NotRunning);
        }

        info!("Initiating queue intake shutdown");

        // Ignore send error - the loop may have already stopped
        let _ = self.shutdown_tx.send(());
        self.is_running.store(false, Ordering::SeqCst);

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        match tokio::time::timeout(self.config.shutdown_timeout, handle).await {
            Ok(Ok(())) => {
                info!("Queue intake shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Intake task panicked during shutdown");
                Ok(())
            }
            Err(_) => Err(IntakeError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current intake statistics.
    pub fn stats(&self) -> IntakeStats {
        self.stats.to_intake_stats()
    }

    /// Returns whether intake is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

struct IntakeLoop {
    queue: Arc<dyn DurableQueue>,
    dispatcher: Dispatcher,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    /// One permit per job taken from the queue and not yet resolved.
    slots: Arc<Semaphore>,
    stats: Arc<SharedIntakeStats>,
    metrics: MetricsCollector,
}

impl IntakeLoop {
    async fn run(mut self) {
        let mut jobs = JoinSet::new();
        let mut last_depth_report: Option<Instant> = None;

        loop {
            // Check for shutdown signal (non-blocking)
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!("Queue intake received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            // Reap finished job tasks so the set does not grow
            while jobs.try_join_next().is_some() {}

            if last_depth_report.map_or(true, |at| at.elapsed() >= DEPTH_REPORT_INTERVAL) {
                self.report_depth().await;
                last_depth_report = Some(Instant::now());
            }

            // A dequeued job reaches the dispatcher's pending list only once
            // its task runs, so intake bounds its own outstanding jobs too
            let permit = match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) if self.dispatcher.has_capacity() => permit,
                _ => {
                    tokio::time::sleep(CAPACITY_POLL).await;
                    continue;
                }
            };

            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(job)) => {
                    self.stats.in_progress.fetch_add(1, Ordering::SeqCst);
                    jobs.spawn(process_job(
                        Arc::clone(&self.queue),
                        self.dispatcher.clone(),
                        job,
                        Arc::clone(&self.stats),
                        permit,
                    ));
                }
                Ok(None) => {
                    // No job available, the dequeue already waited poll_interval
                    debug!("No jobs available");
                }
                Err(e) => {
                    error!(error = %e, "Failed to dequeue job");
                    // Wait before retrying on error
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        // Taken jobs are finished before the loop reports itself stopped
        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Intake job task panicked");
            }
        }

        info!("Queue intake stopped");
    }

    async fn report_depth(&self) {
        match self.queue.stats().await {
            Ok(stats) => {
                self.metrics.set_queue_depth("pending", stats.pending_jobs);
                self.metrics.set_queue_depth("processing", stats.processing_jobs);
                self.metrics.set_queue_depth("completed", stats.completed_records);
            }
            Err(e) => debug!(error = %e, "Could not read queue depth"),
        }
    }
}

/// Runs one dequeued job through the dispatcher and acknowledges it.
async fn process_job(
    queue: Arc<dyn DurableQueue>,
    dispatcher: Dispatcher,
    job: Job,
    stats: Arc<SharedIntakeStats>,
    permit: OwnedSemaphorePermit,
) {
    let job_id = job.id;
    let task_key = job.task_key();
    let start_time = Instant::now();

    info!(
        job_id = %job_id,
        task_key = %task_key,
        recoveries = job.recoveries,
        "Processing queued job"
    );

    let outcome = dispatcher.submit_job(job).await;
    let duration = start_time.elapsed();

    // Rejected before dispatch, so nothing was published for it yet
    if let Err(failure @ JobFailure::InvalidInput(_)) = &outcome {
        let record = CompletionRecord::failure(task_key.clone(), failure.clone());
        if let Err(e) = queue.publish(&record).await {
            error!(job_id = %job_id, error = %e, "Failed to publish rejection record");
        }
    }

    if let Err(e) = queue.ack(job_id).await {
        error!(job_id = %job_id, error = %e, "Failed to acknowledge job");
    }

    stats.record(outcome.is_ok(), duration);
    stats.in_progress.fetch_sub(1, Ordering::SeqCst);
    drop(permit);

    match outcome {
        Ok(_) => info!(
            job_id = %job_id,
            duration_ms = duration.as_millis() as u64,
            "Queued job completed"
        ),
        Err(failure) => warn!(
            job_id = %job_id,
            failure = %failure,
            "Queued job failed"
        ),
    }
}
