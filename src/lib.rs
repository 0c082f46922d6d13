//! mood-forge: audio mood analysis coordinator.
//!
//! This library accepts audio source references, extracts features in
//! isolated worker processes under a concurrency ceiling, runs mood models on
//! the features and caches the aggregated results.

// Core modules
pub mod aggregator;
pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod worker;

// Re-export commonly used error types
pub use error::{CacheError, ExtractionError, InferenceError, JobFailure, SpawnError};
