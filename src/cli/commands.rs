//! CLI command definitions for mood-forge.
//!
//! `serve` runs the coordinator (HTTP API plus queue intake), `worker` is the
//! entry point of a spawned worker unit, and the remaining commands talk to a
//! running deployment or run a one-shot analysis in process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use redis::aio::ConnectionManager;
use serde_json::json;
use tracing::{info, warn};

use crate::aggregator::{ModelRegistry, ModelSpec};
use crate::api::{self, AppState};
use crate::cache::{MemoryResultCache, RedisResultCache, ResultCache};
use crate::config::CoordinatorConfig;
use crate::engine::{FramewiseExtractor, HttpInferenceEngine};
use crate::metrics::init_metrics;
use crate::scheduler::{
    validate_source_ref, CoordinatorContext, DispatchSettings, Dispatcher, DurableQueue,
    IntakeConfig, Job, MemoryJobQueue, QueueIntake, RedisJobQueue, TaskKey,
};
use crate::worker::{run_worker, ProcessSpawner, SpawnParams, WorkerSpawner};

/// Timeout for a single call to the inference server.
const INFERENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Audio mood analysis coordinator.
#[derive(Parser)]
#[command(name = "mood-forge")]
#[command(about = "Analyse audio mood with bounded worker processes and model inference")]
#[command(version)]
#[command(
    long_about = "mood-forge extracts audio features in isolated worker processes, runs mood models on them and caches the results.\n\nExample usage:\n  mood-forge serve --bind 0.0.0.0:3000 --max-workers 5\n  mood-forge predict https://cdn.example.com/track.mp3"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the coordinator: HTTP API and durable queue intake.
    Serve(ServeArgs),

    /// Run one worker unit (spawned by the coordinator).
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Enqueue source references on the durable queue.
    Submit(SubmitArgs),

    /// Show the state of a task key or source reference.
    Status(StatusArgs),

    /// Analyse source references in process and print the results.
    Predict(PredictArgs),

    /// Load and warm up every configured model.
    InitModels(InitModelsArgs),
}

/// Overrides applied on top of the environment configuration.
#[derive(clap::Args, Debug, Default)]
pub struct ConfigOverrides {
    /// Redis connection URL.
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Queue key prefix.
    #[arg(long)]
    pub queue: Option<String>,

    /// Inference server base URL.
    #[arg(long)]
    pub inference_url: Option<String>,

    /// Comma-separated models, `!` suffix marks inverted polarity.
    #[arg(long)]
    pub models: Option<String>,
}

impl ConfigOverrides {
    fn apply(&self, mut config: CoordinatorConfig) -> CoordinatorConfig {
        if let Some(url) = &self.redis_url {
            config = config.with_redis_url(url.clone());
        }
        if let Some(queue) = &self.queue {
            config = config.with_queue_name(queue.clone());
        }
        if let Some(url) = &self.inference_url {
            config.inference_url = url.clone();
        }
        if let Some(models) = &self.models {
            config = config.with_models(ModelSpec::parse_list(models));
        }
        config
    }
}

/// Arguments for `mood-forge serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ConfigOverrides,

    /// Address the HTTP API binds to.
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Maximum number of concurrent worker units.
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    /// Per-job deadline in seconds.
    #[arg(long)]
    pub job_timeout_secs: Option<u64>,

    /// Serve the HTTP API without consuming the durable queue.
    #[arg(long)]
    pub no_intake: bool,
}

/// Arguments for `mood-forge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Reference to the audio to analyse.
    #[arg(long)]
    pub source_ref: String,

    /// Decoded audio above this size is rejected.
    #[arg(long)]
    pub max_memory_mb: Option<u64>,
}

/// Arguments for `mood-forge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Source references to enqueue.
    #[arg(required = true)]
    pub source_refs: Vec<String>,

    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

/// Arguments for `mood-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Task key (`task:<sourceRef>`) or source reference.
    pub key: String,

    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

/// Arguments for `mood-forge predict`.
#[derive(Parser, Debug)]
pub struct PredictArgs {
    /// Source references to analyse.
    #[arg(required = true)]
    pub source_refs: Vec<String>,

    /// Maximum number of concurrent worker units.
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

/// Arguments for `mood-forge init-models`.
#[derive(Parser, Debug)]
pub struct InitModelsArgs {
    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Predict(args) => run_predict_command(args).await,
        Commands::InitModels(args) => run_init_models_command(args).await,
    }
}

fn load_config(overrides: &ConfigOverrides) -> anyhow::Result<CoordinatorConfig> {
    let config = overrides.apply(CoordinatorConfig::from_env()?);
    config.validate()?;
    Ok(config)
}

async fn load_registry(config: &CoordinatorConfig) -> anyhow::Result<Arc<ModelRegistry>> {
    let engine = HttpInferenceEngine::new(config.inference_url.clone(), INFERENCE_TIMEOUT)?;
    let registry = ModelRegistry::load(Arc::new(engine), config.models.clone())
        .await
        .with_context(|| format!("Failed to load models from {}", config.inference_url))?;
    Ok(Arc::new(registry))
}

fn build_spawner(config: &CoordinatorConfig) -> anyhow::Result<Arc<dyn WorkerSpawner>> {
    let spawner = match &config.worker_program {
        Some(program) => ProcessSpawner::new(program.clone()),
        None => ProcessSpawner::current_exe()?,
    };
    Ok(Arc::new(spawner))
}

async fn connect_redis(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))
}

/// Resolves either a task key or a bare source reference to a task key.
fn resolve_task_key(raw: &str) -> TaskKey {
    TaskKey::parse(raw.trim()).unwrap_or_else(|| TaskKey::from_source(raw))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.overrides)?;
    if let Some(bind) = args.bind {
        config = config.with_bind_addr(bind);
    }
    if let Some(max) = args.max_workers {
        config = config.with_max_concurrent_workers(max);
    }
    if let Some(secs) = args.job_timeout_secs {
        config = config.with_job_timeout(Duration::from_secs(secs));
    }
    config.validate()?;

    init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;

    info!(
        max_workers = config.max_concurrent_workers,
        job_timeout_secs = config.job_timeout.as_secs(),
        models = config.models.len(),
        "Starting coordinator"
    );

    let registry = load_registry(&config).await?;
    let redis = connect_redis(&config.redis_url).await?;
    let queue: Arc<dyn DurableQueue> =
        Arc::new(RedisJobQueue::from_connection(redis.clone(), &config.queue_name));
    let cache: Arc<dyn ResultCache> = Arc::new(RedisResultCache::from_connection(redis));

    let dispatcher = Dispatcher::new(CoordinatorContext {
        settings: DispatchSettings::from_config(&config),
        registry,
        cache,
        queue: queue.clone(),
        spawner: build_spawner(&config)?,
    });

    let mut intake = QueueIntake::new(
        IntakeConfig::default()
            .with_poll_interval(config.poll_interval)
            .with_shutdown_timeout(config.shutdown_timeout),
        queue.clone(),
        dispatcher.clone(),
    );
    if !args.no_intake {
        intake.start().await?;
    }

    let state = AppState::new(dispatcher, queue, config.api_token.clone());
    api::serve(state, &config.bind_addr, shutdown_signal()).await?;

    if intake.is_running() {
        if let Err(e) = intake.shutdown().await {
            warn!(error = %e, "Queue intake did not stop cleanly");
        }
        let stats = intake.stats();
        info!(
            completed = stats.jobs_completed,
            failed = stats.jobs_failed,
            "Queue intake stopped"
        );
    }

    Ok(())
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let params = SpawnParams {
        source_ref: args.source_ref,
        max_memory_mb: args.max_memory_mb,
    };
    run_worker(params, Arc::new(FramewiseExtractor::new())).await?;
    Ok(())
}

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let config = load_config(&args.overrides)?;
    for source_ref in &args.source_refs {
        validate_source_ref(source_ref)?;
    }

    let queue = RedisJobQueue::connect(&config.redis_url, &config.queue_name).await?;
    for source_ref in &args.source_refs {
        let job = Job::new(source_ref.as_str());
        queue.enqueue(&job).await?;
        println!(
            "{}",
            json!({
                "taskKey": job.task_key(),
                "jobId": job.id,
                "sourceRef": job.source_ref,
            })
        );
    }

    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = load_config(&args.overrides)?;
    let key = resolve_task_key(&args.key);

    let redis = connect_redis(&config.redis_url).await?;
    let cache = RedisResultCache::from_connection(redis.clone());
    let queue = RedisJobQueue::from_connection(redis, &config.queue_name);

    if let Some(result) = cache.get(&key).await? {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "taskKey": key,
                "state": "completed",
                "result": result.flattened(),
            }))?
        );
        return Ok(());
    }

    match queue.state(&key).await? {
        Some(state) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "taskKey": key, "state": state }))?
            );
            Ok(())
        }
        None => anyhow::bail!("Unknown task key: {}", key),
    }
}

async fn run_predict_command(args: PredictArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.overrides)?;
    if let Some(max) = args.max_workers {
        config = config.with_max_concurrent_workers(max);
    }

    let registry = load_registry(&config).await?;
    let dispatcher = Dispatcher::new(CoordinatorContext {
        settings: DispatchSettings::from_config(&config),
        registry,
        cache: Arc::new(MemoryResultCache::new()),
        queue: Arc::new(MemoryJobQueue::new()),
        spawner: build_spawner(&config)?,
    });

    let outcomes = dispatcher.submit_batch(&args.source_refs).await;

    let mut failed = 0usize;
    let mut output = serde_json::Map::new();
    for (source_ref, outcome) in outcomes {
        let value = match outcome {
            Ok(result) => serde_json::Value::Object(result.flattened()),
            Err(failure) => {
                failed += 1;
                json!({ "error": { "kind": failure.kind(), "message": failure.to_string() } })
            }
        };
        output.insert(source_ref, value);
    }

    // A single reference prints the bare result object
    let rendered = if output.len() == 1 {
        output
            .into_iter()
            .next()
            .map(|(_, value)| value)
            .unwrap_or_default()
    } else {
        serde_json::Value::Object(output)
    };
    println!("{}", serde_json::to_string_pretty(&rendered)?);

    if failed > 0 {
        anyhow::bail!("{} of {} references failed", failed, args.source_refs.len());
    }
    Ok(())
}

async fn run_init_models_command(args: InitModelsArgs) -> anyhow::Result<()> {
    let config = load_config(&args.overrides)?;
    let registry = load_registry(&config).await?;

    for model in registry.models() {
        println!("{}", model);
    }
    info!(count = registry.models().len(), "All models loaded and warmed up");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_command_parsing() {
        let args = vec![
            "mood-forge",
            "serve",
            "--bind",
            "127.0.0.1:8080",
            "-w",
            "3",
            "--job-timeout-secs",
            "60",
            "--redis-url",
            "redis://cache:6379",
            "--no-intake",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.bind.as_deref(), Some("127.0.0.1:8080"));
                assert_eq!(args.max_workers, Some(3));
                assert_eq!(args.job_timeout_secs, Some(60));
                assert_eq!(
                    args.overrides.redis_url.as_deref(),
                    Some("redis://cache:6379")
                );
                assert!(args.no_intake);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_worker_command_parsing() {
        let args = vec![
            "mood-forge",
            "worker",
            "--source-ref",
            "file:///tmp/a.wav",
            "--max-memory-mb",
            "256",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.source_ref, "file:///tmp/a.wav");
                assert_eq!(args.max_memory_mb, Some(256));
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_submit_requires_references() {
        assert!(Cli::try_parse_from(vec!["mood-forge", "submit"]).is_err());

        let cli = Cli::try_parse_from(vec![
            "mood-forge",
            "submit",
            "https://x/a.mp3",
            "https://x/b.mp3",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Submit(args) => assert_eq!(args.source_refs.len(), 2),
            _ => panic!("Expected Submit command"),
        }
    }

    #[test]
    fn test_global_log_level() {
        let cli = Cli::try_parse_from(vec![
            "mood-forge",
            "init-models",
            "--log-level",
            "debug",
            "--models",
            "mood_sad!",
        ])
        .expect("should parse");
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::InitModels(args) => {
                assert_eq!(args.overrides.models.as_deref(), Some("mood_sad!"))
            }
            _ => panic!("Expected InitModels command"),
        }
    }

    #[test]
    fn test_overrides_apply() {
        let overrides = ConfigOverrides {
            redis_url: Some("redis://other:6379".into()),
            queue: None,
            inference_url: None,
            models: Some("a,b!".into()),
        };
        let config = overrides.apply(CoordinatorConfig::default());
        assert_eq!(config.redis_url, "redis://other:6379");
        assert_eq!(config.queue_name, "mood_forge:jobs");
        assert_eq!(
            config.models,
            vec![ModelSpec::new("a", false), ModelSpec::new("b", true)]
        );
    }

    #[test]
    fn test_resolve_task_key() {
        assert_eq!(
            resolve_task_key("task:https://x/a.mp3"),
            TaskKey::from_source("https://x/a.mp3")
        );
        assert_eq!(
            resolve_task_key("https://x/a.mp3"),
            TaskKey::from_source("https://x/a.mp3")
        );
    }
}
