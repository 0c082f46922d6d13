//! Coordinator configuration.
//!
//! This module collects the settings the coordinator consumes: queue
//! connection, concurrency ceiling, result TTL, per-job deadline, API
//! credential, inference endpoint and the registered models.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::aggregator::ModelSpec;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Models registered by default, `!` marks inverted label polarity.
pub const DEFAULT_MODELS: &str = "mood_dancability,mood_happy,mood_sad!,mood_relaxed!,mood_aggressive";

/// Configuration for the coordinator process.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    // Queue settings
    /// Redis connection URL shared by the durable queue and result cache.
    pub redis_url: String,
    /// Prefix for the queue's Redis keys.
    pub queue_name: String,
    /// How long a single dequeue blocks when the queue is empty.
    pub poll_interval: Duration,

    // Execution settings
    /// Maximum number of worker units alive at once.
    pub max_concurrent_workers: usize,
    /// Deadline for a worker unit to answer, measured from dispatch.
    pub job_timeout: Duration,
    /// Optional per-worker memory ceiling hint, in MB.
    pub worker_max_memory_mb: Option<u64>,
    /// Executable used for worker units (defaults to the current binary).
    pub worker_program: Option<PathBuf>,
    /// Time allowed for queue intake to drain on shutdown.
    pub shutdown_timeout: Duration,

    // Result settings
    /// Time-to-live of cached results.
    pub result_ttl: Duration,
    /// Attempts for each persistence write before giving up.
    pub persist_attempts: u32,
    /// Delay before the first persistence retry, doubled on each attempt.
    pub persist_backoff: Duration,

    // Inference settings
    /// Base URL of the inference server.
    pub inference_url: String,
    /// Models run for every job.
    pub models: Vec<ModelSpec>,

    // API settings
    /// Address the HTTP API binds to.
    pub bind_addr: String,
    /// Credential required by the submission API (disabled when unset).
    pub api_token: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "mood_forge:jobs".to_string(),
            poll_interval: Duration::from_secs(1),

            max_concurrent_workers: 5,
            job_timeout: Duration::from_secs(300), // 5 minutes
            worker_max_memory_mb: None,
            worker_program: None,
            shutdown_timeout: Duration::from_secs(60),

            result_ttl: Duration::from_secs(3600), // 1 hour
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(200),

            inference_url: "http://localhost:8501".to_string(),
            models: ModelSpec::parse_list(DEFAULT_MODELS),

            bind_addr: "0.0.0.0:3000".to_string(),
            api_token: None,
        }
    }
}

impl CoordinatorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `MOOD_FORGE_QUEUE`: Queue key prefix (default: mood_forge:jobs)
    /// - `MOOD_FORGE_POLL_INTERVAL_SECS`: Dequeue block time (default: 1)
    /// - `MOOD_FORGE_MAX_WORKERS`: Concurrency ceiling (default: 5)
    /// - `MOOD_FORGE_JOB_TIMEOUT_SECS`: Per-job deadline (default: 300)
    /// - `MOOD_FORGE_WORKER_MAX_MEMORY_MB`: Worker memory hint (default: unset)
    /// - `MOOD_FORGE_WORKER_PROGRAM`: Worker executable (default: current binary)
    /// - `MOOD_FORGE_RESULT_TTL_SECS`: Result cache TTL (default: 3600)
    /// - `MOOD_FORGE_PERSIST_ATTEMPTS`: Persistence attempts (default: 3)
    /// - `MOOD_FORGE_INFERENCE_URL`: Inference server (default: http://localhost:8501)
    /// - `MOOD_FORGE_MODELS`: Comma-separated models, `!` suffix for inverted polarity
    /// - `MOOD_FORGE_BIND`: API bind address, falls back to `0.0.0.0:$PORT`
    /// - `MOOD_FORGE_API_TOKEN`: API credential (default: unset, auth disabled)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if variables have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Queue settings
        if let Ok(val) = std::env::var("REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("MOOD_FORGE_QUEUE") {
            config.queue_name = val;
        }

        if let Ok(val) = std::env::var("MOOD_FORGE_POLL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "MOOD_FORGE_POLL_INTERVAL_SECS")?;
            config.poll_interval = Duration::from_secs(secs);
        }

        // Execution settings
        if let Ok(val) = std::env::var("MOOD_FORGE_MAX_WORKERS") {
            config.max_concurrent_workers = parse_env_value(&val, "MOOD_FORGE_MAX_WORKERS")?;
        }

        if let Ok(val) = std::env::var("MOOD_FORGE_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "MOOD_FORGE_JOB_TIMEOUT_SECS")?;
            config.job_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("MOOD_FORGE_WORKER_MAX_MEMORY_MB") {
            config.worker_max_memory_mb =
                Some(parse_env_value(&val, "MOOD_FORGE_WORKER_MAX_MEMORY_MB")?);
        }

        if let Ok(val) = std::env::var("MOOD_FORGE_WORKER_PROGRAM") {
            config.worker_program = Some(PathBuf::from(val));
        }

        // Result settings
        if let Ok(val) = std::env::var("MOOD_FORGE_RESULT_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "MOOD_FORGE_RESULT_TTL_SECS")?;
            config.result_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("MOOD_FORGE_PERSIST_ATTEMPTS") {
            config.persist_attempts = parse_env_value(&val, "MOOD_FORGE_PERSIST_ATTEMPTS")?;
        }

        // Inference settings
        if let Ok(val) = std::env::var("MOOD_FORGE_INFERENCE_URL") {
            config.inference_url = val;
        }

        if let Ok(val) = std::env::var("MOOD_FORGE_MODELS") {
            config.models = ModelSpec::parse_list(&val);
        }

        // API settings
        if let Ok(val) = std::env::var("MOOD_FORGE_BIND") {
            config.bind_addr = val;
        } else if let Ok(val) = std::env::var("PORT") {
            let port: u16 = parse_env_value(&val, "PORT")?;
            config.bind_addr = format!("0.0.0.0:{}", port);
        }

        config.api_token = std::env::var("MOOD_FORGE_API_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.max_concurrent_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_workers must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        if self.result_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "result_ttl must be greater than 0".to_string(),
            ));
        }

        if self.persist_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "persist_attempts must be at least 1".to_string(),
            ));
        }

        if self.worker_max_memory_mb == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "worker_max_memory_mb must be greater than 0 when set".to_string(),
            ));
        }

        if self.models.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one model must be registered".to_string(),
            ));
        }

        if self.inference_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "inference_url cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Builder method to set the concurrency ceiling.
    pub fn with_max_concurrent_workers(mut self, max: usize) -> Self {
        self.max_concurrent_workers = max;
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

    /// Builder method to set persistence retry behaviour.
    pub fn with_persist_policy(mut self, attempts: u32, backoff: Duration) -> Self {
        self.persist_attempts = attempts;
        self.persist_backoff = backoff;
        self
    }

    /// Builder method to set the worker memory hint.
    pub fn with_worker_max_memory_mb(mut self, limit: Option<u64>) -> Self {
        self.worker_max_memory_mb = limit;
        self
    }

    /// Builder method to set the registered models.
    pub fn with_models(mut self, models: Vec<ModelSpec>) -> Self {
        self.models = models;
        self
    }

    /// Builder method to set the API credential.
    pub fn with_api_token(mut self, token: Option<String>) -> Self {
        self.api_token = token;
        self
    }

    /// Builder method to set the API bind address.
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
