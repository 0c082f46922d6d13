//! High-level interface for recording coordinator metrics.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics and
//! provides convenient methods for the events the dispatcher, cache and
//! aggregator report. Every method is a no-op until `init_metrics()` ran.

use super::prometheus::{
    ACTIVE_WORKERS, CACHE_LOOKUPS, INFERENCE_LATENCY, JOBS_TOTAL, JOB_DURATION, PENDING_JOBS,
    QUEUE_DEPTH, STORAGE_RETRIES,
};

/// Metrics collector for recording mood-forge operational metrics.
///
/// # Example
///
/// ```ignore
/// use mood_forge::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_job("completed", 12.5);
/// collector.record_cache_lookup(true);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a resolved job.
    ///
    /// # Arguments
    ///
    /// * `outcome` - `completed` or a failure kind (e.g., "timeout", "worker_crashed")
    /// * `duration_secs` - Time from dispatch to resolution in seconds
    pub fn record_job(&self, outcome: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[outcome]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[outcome])
                .observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Set the dispatcher occupancy gauges.
    pub fn set_dispatcher_load(&self, active: usize, pending: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(active as f64);
        }

        if let Some(pending_jobs) = PENDING_JOBS.get() {
            pending_jobs.set(pending as f64);
        }
    }

    /// Set the depth of one durable queue list.
    pub fn set_queue_depth(&self, list: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[list]).set(depth as f64);
        }
    }

    /// Record a result cache lookup.
    pub fn record_cache_lookup(&self, hit: bool) {
        if let Some(cache_lookups) = CACHE_LOOKUPS.get() {
            let result = if hit { "hit" } else { "miss" };
            cache_lookups.with_label_values(&[result]).inc();
        }
    }

    /// Record the latency of one inference call.
    pub fn record_inference(&self, model: &str, latency_secs: f64) {
        if let Some(inference_latency) = INFERENCE_LATENCY.get() {
            inference_latency
                .with_label_values(&[model])
                .observe(latency_secs);
        }
    }

    /// Record a retried persistence write.
    pub fn record_storage_retry(&self) {
        if let Some(storage_retries) = STORAGE_RETRIES.get() {
            storage_retries.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::prometheus::{export_metrics, init_metrics};

    #[test]
    fn test_collector_records_without_init() {
        // Must not panic whether or not the registry exists
        let collector = MetricsCollector::new();
        collector.record_job("completed", 1.0);
        collector.record_cache_lookup(false);
        collector.set_dispatcher_load(1, 2);
    }

    #[test]
    fn test_collector_records_after_init() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_job("timeout", 300.0);
        collector.record_cache_lookup(true);
        collector.record_inference("mood_sad", 0.12);
        collector.record_storage_retry();
        collector.set_queue_depth("pending", 4);

        let metrics = export_metrics();
        assert!(metrics.contains("mood_forge_cache_lookups_total"));
        assert!(metrics.contains("mood_forge_inference_latency_seconds"));
        assert!(metrics.contains("mood_forge_storage_retries_total"));
    }
}
