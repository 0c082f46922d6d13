//! Concurrency-bounded dispatch of jobs to worker units.
//!
//! The dispatcher owns the coordinator's slot budget. A submission is
//! validated, coalesced with an identical in-flight task key, answered from
//! the result cache, or queued FIFO until a slot frees up. Each dispatched
//! job runs in its own task:
//!
//! ```text
//! spawn unit ─► supervise (deadline) ─► aggregate ─► persist ─► resolve waiters
//! ```
//!
//! The slot is held by a `SlotGuard` for the whole run and released in its
//! `Drop`, which also pulls the next pending job.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;

use super::job::{
    validate_source_ref, CompletionRecord, Job, JobState, StatusReport, TaskKey, WorkResult,
};
use super::queue::DurableQueue;
use super::supervisor::supervise;
use crate::aggregator::{ModelRegistry, ResultAggregator};
use crate::cache::ResultCache;
use crate::config::CoordinatorConfig;
use crate::error::JobFailure;
use crate::metrics::MetricsCollector;
use crate::worker::{SpawnParams, WorkerSpawner};

/// Terminal states remembered locally for status queries.
const MAX_TRACKED_STATES: usize = 10_000;

/// Outcome every waiter on a task key receives.
pub type JobOutcome = Result<WorkResult, JobFailure>;

/// Dispatch settings taken from the coordinator configuration.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_concurrent_workers: usize,
    pub job_timeout: Duration,
    pub result_ttl: Duration,
    pub worker_max_memory_mb: Option<u64>,
    pub persist_attempts: u32,
    pub persist_backoff: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

impl DispatchSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            max_concurrent_workers: config.max_concurrent_workers.max(1),
            job_timeout: config.job_timeout,
            result_ttl: config.result_ttl,
            worker_max_memory_mb: config.worker_max_memory_mb,
            persist_attempts: config.persist_attempts.max(1),
            persist_backoff: config.persist_backoff,
        }
    }

    /// Builder method to set the concurrency ceiling.
    pub fn with_max_concurrent_workers(mut self, max: usize) -> Self {
        self.max_concurrent_workers = max.max(1);
        self
    }

    /// Builder method to set the per-job deadline.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Builder method to set the result TTL.
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    /// Builder method to set the persistence retry policy.
    pub fn with_persist_policy(mut self, attempts: u32, backoff: Duration) -> Self {
        self.persist_attempts = attempts.max(1);
        self.persist_backoff = backoff;
        self
    }
}

/// Everything the dispatcher needs, built once after the models are loaded.
pub struct CoordinatorContext {
    pub settings: DispatchSettings,
    pub registry: Arc<ModelRegistry>,
    pub cache: Arc<dyn ResultCache>,
    pub queue: Arc<dyn DurableQueue>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

/// Counters exposed by `Dispatcher::stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub max_concurrent_workers: usize,
    /// Worker units currently holding a slot.
    pub active: usize,
    /// Jobs waiting for a slot.
    pub pending: usize,
    /// Distinct task keys being computed or waiting.
    pub in_flight: usize,
    /// Highest `active` value observed.
    pub peak_active: usize,
    /// Worker units started.
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    /// Submissions answered from the result cache.
    pub cache_hits: u64,
    /// Submissions that joined an in-flight computation.
    pub coalesced: u64,
}

#[derive(Debug, Clone)]
struct TrackedJob {
    state: JobState,
    failure: Option<JobFailure>,
}

#[derive(Default)]
struct DispatchState {
    active: usize,
    pending: VecDeque<Job>,
    inflight: HashMap<TaskKey, Vec<oneshot::Sender<JobOutcome>>>,
    tracked: HashMap<TaskKey, TrackedJob>,
    finished_order: VecDeque<TaskKey>,
    stats: DispatcherStats,
}

impl DispatchState {
    fn track(&mut self, key: &TaskKey, state: JobState, failure: Option<JobFailure>) {
        self.tracked
            .insert(key.clone(), TrackedJob { state, failure });

        if state.is_terminal() {
            self.finished_order.push_back(key.clone());
            while self.finished_order.len() > MAX_TRACKED_STATES {
                if let Some(oldest) = self.finished_order.pop_front() {
                    let still_terminal = self
                        .tracked
                        .get(&oldest)
                        .is_some_and(|tracked| tracked.state.is_terminal());
                    if still_terminal {
                        self.tracked.remove(&oldest);
                    }
                }
            }
        }
    }
}

struct DispatcherInner {
    settings: DispatchSettings,
    aggregator: ResultAggregator,
    cache: Arc<dyn ResultCache>,
    queue: Arc<dyn DurableQueue>,
    spawner: Arc<dyn WorkerSpawner>,
    state: Mutex<DispatchState>,
    metrics: MetricsCollector,
}

impl DispatcherInner {
    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds one concurrency slot; releasing it dispatches the next pending job.
struct SlotGuard {
    inner: Arc<DispatcherInner>,
    key: TaskKey,
    resolved: bool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let dispatcher = Dispatcher {
            inner: self.inner.clone(),
        };

        // Releasing the slot and handing it to the next waiting job happen
        // under one lock, so `pending > 0` never coexists with a free slot
        let (orphaned, next) = {
            let mut state = self.inner.lock();
            state.active = state.active.saturating_sub(1);
            let orphaned = if self.resolved {
                None
            } else {
                state.inflight.remove(&self.key)
            };
            (orphaned, dispatcher.claim_slot(&mut state))
        };

        if let Some(waiters) = orphaned {
            tracing::error!(task_key = %self.key, "Job task ended without resolving its waiters");
            let failure = JobFailure::WorkerError("job aborted before completion".to_string());
            for waiter in waiters {
                let _ = waiter.send(Err(failure.clone()));
            }
        }

        if let Some(job) = next {
            dispatcher.launch(job);
        }
        dispatcher.try_dispatch_next();
    }
}

/// Bounded, deduplicating job dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(context: CoordinatorContext) -> Self {
        let stats = DispatcherStats {
            max_concurrent_workers: context.settings.max_concurrent_workers,
            ..Default::default()
        };

        Self {
            inner: Arc::new(DispatcherInner {
                settings: context.settings,
                aggregator: ResultAggregator::new(context.registry),
                cache: context.cache,
                queue: context.queue,
                spawner: context.spawner,
                state: Mutex::new(DispatchState {
                    stats,
                    ..Default::default()
                }),
                metrics: MetricsCollector::new(),
            }),
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.inner.settings
    }

    /// Submits a source reference and waits for its result.
    ///
    /// Malformed references fail with `InvalidInput` before any slot or
    /// in-flight entry is touched.
    pub async fn submit(&self, source_ref: &str) -> JobOutcome {
        validate_source_ref(source_ref)?;
        self.submit_job(Job::new(source_ref)).await
    }

    /// Submits several references; each resolves independently.
    pub async fn submit_batch(&self, source_refs: &[String]) -> Vec<(String, JobOutcome)> {
        let submissions = source_refs.iter().map(|source_ref| async move {
            (source_ref.clone(), self.submit(source_ref).await)
        });
        futures::future::join_all(submissions).await
    }

    /// Submits an already-built job, as taken from the durable queue.
    pub async fn submit_job(&self, job: Job) -> JobOutcome {
        validate_source_ref(&job.source_ref)?;
        let key = job.task_key();

        if let Some(receiver) = self.join_inflight(&key) {
            tracing::debug!(task_key = %key, "Joined in-flight computation");
            return Self::wait_for(receiver).await;
        }

        match self.inner.cache.get(&key).await {
            Ok(Some(result)) => {
                self.inner.metrics.record_cache_lookup(true);
                {
                    let mut state = self.inner.lock();
                    state.stats.cache_hits += 1;
                    state.track(&key, JobState::Completed, None);
                }
                tracing::debug!(task_key = %key, "Answered from result cache");
                return Ok(result);
            }
            Ok(None) => self.inner.metrics.record_cache_lookup(false),
            Err(e) => {
                self.inner.metrics.record_cache_lookup(false);
                tracing::warn!(task_key = %key, error = %e, "Result cache lookup failed, computing");
            }
        }

        let receiver = {
            let mut state = self.inner.lock();
            let (sender, receiver) = oneshot::channel();
            match state.inflight.entry(key.clone()) {
                Entry::Occupied(mut waiters) => {
                    waiters.get_mut().push(sender);
                    state.stats.coalesced += 1;
                }
                Entry::Vacant(slot) => {
                    slot.insert(vec![sender]);
                    state.pending.push_back(job);
                    state.track(&key, JobState::Queued, None);
                }
            }
            receiver
        };

        self.try_dispatch_next();
        Self::wait_for(receiver).await
    }

    fn join_inflight(&self, key: &TaskKey) -> Option<oneshot::Receiver<JobOutcome>> {
        let mut state = self.inner.lock();
        let waiters = state.inflight.get_mut(key)?;
        let (sender, receiver) = oneshot::channel();
        waiters.push(sender);
        state.stats.coalesced += 1;
        Some(receiver)
    }

    async fn wait_for(receiver: oneshot::Receiver<JobOutcome>) -> JobOutcome {
        receiver.await.unwrap_or_else(|_| {
            Err(JobFailure::WorkerError(
                "dispatcher dropped the job".to_string(),
            ))
        })
    }

    /// Dispatches pending jobs while slots are free, in FIFO order.
    ///
    /// Safe to call from anywhere, including a slot guard's `Drop`: each
    /// dispatch takes the lock once and never holds it across the spawn.
    pub fn try_dispatch_next(&self) {
        loop {
            let job = {
                let mut state = self.inner.lock();
                match self.claim_slot(&mut state) {
                    Some(job) => job,
                    None => return,
                }
            };
            self.launch(job);
        }
    }

    /// Takes the oldest pending job and counts it active, if a slot is free.
    fn claim_slot(&self, state: &mut DispatchState) -> Option<Job> {
        if state.active >= self.inner.settings.max_concurrent_workers {
            self.publish_load(state);
            return None;
        }
        let Some(job) = state.pending.pop_front() else {
            self.publish_load(state);
            return None;
        };
        state.active += 1;
        state.stats.peak_active = state.stats.peak_active.max(state.active);
        state.track(&job.task_key(), JobState::Active, None);
        Some(job)
    }

    /// Runs a job that already holds a slot.
    fn launch(&self, job: Job) {
        let guard = SlotGuard {
            inner: self.inner.clone(),
            key: job.task_key(),
            resolved: false,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(run_job(self.inner.clone(), job, guard));
            }
            // Dropping the guard frees the slot and fails the job's waiters
            Err(_) => tracing::warn!(task_key = %guard.key, "No runtime available, job dropped"),
        }
    }

    fn publish_load(&self, state: &DispatchState) {
        self.inner
            .metrics
            .set_dispatcher_load(state.active, state.pending.len());
    }

    /// Returns whether a newly dispatched job would get a slot right away.
    pub fn has_capacity(&self) -> bool {
        let state = self.inner.lock();
        state.active + state.pending.len() < self.inner.settings.max_concurrent_workers
    }

    /// Returns a snapshot of the dispatcher counters.
    pub fn stats(&self) -> DispatcherStats {
        let state = self.inner.lock();
        DispatcherStats {
            active: state.active,
            pending: state.pending.len(),
            in_flight: state.inflight.len(),
            ..state.stats.clone()
        }
    }

    /// Looks up the state of a task key.
    ///
    /// Local knowledge wins; otherwise the result cache and then the durable
    /// queue's state record are consulted. Returns `None` for unknown keys.
    pub async fn status(&self, key: &TaskKey) -> Option<StatusReport> {
        let tracked = self.inner.lock().tracked.get(key).cloned();

        if let Some(tracked) = tracked {
            let result = if tracked.state == JobState::Completed {
                self.inner.cache.get(key).await.ok().flatten()
            } else {
                None
            };
            return Some(StatusReport {
                task_key: key.clone(),
                state: tracked.state,
                result,
                failure: tracked.failure,
            });
        }

        if let Ok(Some(result)) = self.inner.cache.get(key).await {
            return Some(StatusReport {
                task_key: key.clone(),
                state: JobState::Completed,
                result: Some(result),
                failure: None,
            });
        }

        match self.inner.queue.state(key).await {
            Ok(Some(state)) => Some(StatusReport {
                task_key: key.clone(),
                state,
                result: None,
                failure: None,
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(task_key = %key, error = %e, "Queue state lookup failed");
                None
            }
        }
    }
}

/// Runs one dispatched job to resolution.
async fn run_job(inner: Arc<DispatcherInner>, job: Job, mut guard: SlotGuard) {
    let key = job.task_key();
    let started = Instant::now();

    tracing::info!(job_id = %job.id, task_key = %key, "Dispatching job");

    if let Err(e) = inner.queue.set_state(&key, JobState::Active).await {
        tracing::debug!(task_key = %key, error = %e, "Could not record active state");
    }

    let outcome = execute(&inner, &job).await;

    if let Err(failure) = &outcome {
        let record = CompletionRecord::failure(key.clone(), failure.clone());
        if let Err(e) = inner.queue.publish(&record).await {
            tracing::error!(task_key = %key, error = %e, "Failed to publish failure record");
        }
    }

    let elapsed = started.elapsed();
    let label = match &outcome {
        Ok(_) => "completed",
        Err(failure) => failure.kind(),
    };
    inner.metrics.record_job(label, elapsed.as_secs_f64());

    match &outcome {
        Ok(_) => tracing::info!(
            job_id = %job.id,
            task_key = %key,
            duration_ms = elapsed.as_millis() as u64,
            "Job completed"
        ),
        Err(failure) => tracing::warn!(
            job_id = %job.id,
            task_key = %key,
            duration_ms = elapsed.as_millis() as u64,
            failure = %failure,
            "Job failed"
        ),
    }

    let waiters = {
        let mut state = inner.lock();
        let terminal = JobState::from_outcome(&outcome);
        state.track(&key, terminal, outcome.as_ref().err().cloned());
        if outcome.is_ok() {
            state.stats.completed += 1;
        } else {
            state.stats.failed += 1;
        }
        state.inflight.remove(&key).unwrap_or_default()
    };

    // Free the slot before waking callers so they observe it released
    guard.resolved = true;
    drop(guard);

    for waiter in waiters {
        let _ = waiter.send(outcome.clone());
    }
}

async fn execute(inner: &DispatcherInner, job: &Job) -> JobOutcome {
    let key = job.task_key();
    let params = SpawnParams {
        source_ref: job.source_ref.clone(),
        max_memory_mb: inner.settings.worker_max_memory_mb,
    };

    let mut unit = inner.spawner.spawn(&params).map_err(|e| {
        tracing::error!(task_key = %key, error = %e, "Failed to spawn worker");
        JobFailure::SpawnFailure(e.to_string())
    })?;
    inner.lock().stats.spawned += 1;

    let features = supervise(unit.as_mut(), inner.settings.job_timeout).await?;
    drop(unit);

    let result = inner.aggregator.aggregate(&key, &features).await?;
    persist(inner, &result).await?;

    Ok(result)
}

/// Writes the result to the cache, then publishes its completion record.
async fn persist(inner: &DispatcherInner, result: &WorkResult) -> Result<(), JobFailure> {
    let ttl = inner.settings.result_ttl;

    let written = with_retry(inner, "result cache write", || {
        inner.cache.put(result, ttl)
    })
    .await;

    let published = match written {
        Ok(()) => {
            let record = CompletionRecord::success(result.clone());
            with_retry(inner, "completion publish", || inner.queue.publish(&record)).await
        }
        Err(e) => Err(e),
    };

    published.map_err(|reason| {
        let serialized = serde_json::to_string(result)
            .unwrap_or_else(|e| format!("<unserializable result: {}>", e));
        tracing::error!(
            task_key = %result.task_key,
            result = %serialized,
            error = %reason,
            "Failed to persist result"
        );
        JobFailure::StorageFailure(reason)
    })
}

/// Runs a persistence write with bounded attempts and doubling backoff.
async fn with_retry<F, Fut, E>(inner: &DispatcherInner, what: &str, mut op: F) -> Result<(), String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let attempts = inner.settings.persist_attempts;
    let mut delay = inner.settings.persist_backoff;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < attempts => {
                tracing::warn!(attempt, attempts, error = %e, "{} failed, retrying", what);
                inner.metrics.record_storage_retry();
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(format!("{} failed after {} attempts: {}", what, attempts, e)),
        }
    }
}
