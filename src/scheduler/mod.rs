//! Job scheduling: durable queue, bounded dispatch, worker supervision.
//!
//! - **DurableQueue**: Redis-based job queue with reliable dequeue using BRPOPLPUSH
//! - **Dispatcher**: concurrency ceiling, dedup by task key, FIFO dispatch
//! - **Supervisor**: per-job deadline and outcome classification
//! - **QueueIntake**: background loop feeding queued jobs to the dispatcher
//!
//! # Architecture
//!
//! ```text
//!        ┌──────────────┐              ┌──────────────┐
//!        │  HTTP / CLI  │──enqueue────►│    Redis     │
//!        └──────┬───────┘              │    Queue     │
//!               │ sync submit          └──────┬───────┘
//!               │                             │ BRPOPLPUSH
//!               │                      ┌──────▼───────┐
//!               │                      │ QueueIntake  │
//!               │                      └──────┬───────┘
//!               ▼                             ▼
//!        ┌────────────────────────────────────────────┐
//!        │ Dispatcher (slots, in-flight map, cache)   │
//!        └──────┬───────────────┬───────────────┬─────┘
//!               ▼               ▼               ▼
//!          ┌─────────┐     ┌─────────┐     ┌─────────┐
//!          │ Unit 1  │     │ Unit 2  │     │ Unit N  │
//!          └─────────┘     └─────────┘     └─────────┘
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: jobs move to a processing list until acknowledged
//! - **Crash recovery**: orphaned jobs are requeued on start, failed after 3 recoveries
//! - **Bounded persistence retry**: result writes retry with doubling backoff
//! - **Graceful shutdown**: taken jobs finish before intake stops

pub mod dispatcher;
pub mod intake;
pub mod job;
pub mod queue;
pub mod supervisor;

pub use dispatcher::{CoordinatorContext, DispatchSettings, Dispatcher, DispatcherStats, JobOutcome};
pub use intake::{IntakeConfig, IntakeError, IntakeStats, QueueIntake};
pub use job::{
    validate_source_ref, AuxFeatures, CompletionRecord, Job, JobState, StatusReport, TaskKey,
    WorkResult,
};
pub use queue::{DurableQueue, MemoryJobQueue, QueueError, QueueStats, RedisJobQueue};
pub use supervisor::supervise;
