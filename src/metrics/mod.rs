//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks job outcomes and durations, worker slot occupancy, queue depth,
//! cache effectiveness, inference latency and persistence retries.
//!
//! # Example
//!
//! ```ignore
//! use mood_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("completed", 4.2);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{
    ACTIVE_WORKERS, CACHE_LOOKUPS, INFERENCE_LATENCY, JOBS_TOTAL, JOB_DURATION, PENDING_JOBS,
    QUEUE_DEPTH, REGISTRY, STORAGE_RETRIES,
};
