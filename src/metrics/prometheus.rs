//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by mood-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all mood-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs resolved, labeled by outcome (`completed` or a failure kind).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time from dispatch to resolution, labeled by outcome.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Worker units currently holding a slot.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Jobs waiting for a slot inside the dispatcher.
pub static PENDING_JOBS: OnceLock<Gauge> = OnceLock::new();

/// Durable queue depth, labeled by list.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Result cache lookups, labeled `hit` or `miss`.
pub static CACHE_LOOKUPS: OnceLock<CounterVec> = OnceLock::new();

/// Inference call latency, labeled by model.
pub static INFERENCE_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Persistence writes that had to be retried.
pub static STORAGE_RETRIES: OnceLock<Counter> = OnceLock::new();

/// Initialize all Prometheus metrics and register them with the global registry.
///
/// Calling it more than once is harmless: later calls keep the first registry.
///
/// # Errors
///
/// Returns an error if a metric cannot be created or registered.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("mood_forge_jobs_total", "Total number of jobs resolved"),
        &["outcome"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "mood_forge_job_duration_seconds",
            "Job duration from dispatch to resolution in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["outcome"],
    )?;

    // Worker metrics
    let active_workers = Gauge::new(
        "mood_forge_active_workers",
        "Number of worker units holding a slot",
    )?;

    let pending_jobs = Gauge::new(
        "mood_forge_pending_jobs",
        "Number of jobs waiting for a worker slot",
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("mood_forge_queue_depth", "Number of records per queue list"),
        &["list"],
    )?;

    // Cache metrics
    let cache_lookups = CounterVec::new(
        Opts::new("mood_forge_cache_lookups_total", "Result cache lookups"),
        &["result"],
    )?;

    // Inference metrics
    let inference_latency = HistogramVec::new(
        HistogramOpts::new(
            "mood_forge_inference_latency_seconds",
            "Inference request latency in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["model"],
    )?;

    let storage_retries = Counter::new(
        "mood_forge_storage_retries_total",
        "Persistence writes retried after a failure",
    )?;

    // Register all metrics with the registry
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(pending_jobs.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(cache_lookups.clone()))?;
    registry.register(Box::new(inference_latency.clone()))?;
    registry.register(Box::new(storage_retries.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = PENDING_JOBS.set(pending_jobs);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = CACHE_LOOKUPS.set(cache_lookups);
    let _ = INFERENCE_LATENCY.set(inference_latency);
    let _ = STORAGE_RETRIES.set(storage_retries);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = JOBS_TOTAL.get() {
            counter.with_label_values(&["completed"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("mood_forge_jobs_total"));
    }
}
