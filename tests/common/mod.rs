//! Scripted worker units and inference engine shared by integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mood_forge::aggregator::{ModelRegistry, ModelSpec};
use mood_forge::cache::MemoryResultCache;
use mood_forge::engine::{ExtractedFeatures, FeatureTensor, InferenceEngine};
use mood_forge::error::{InferenceError, SpawnError};
use mood_forge::scheduler::{
    CoordinatorContext, DispatchSettings, Dispatcher, MemoryJobQueue,
};
use mood_forge::worker::{SpawnParams, UnitOutcome, WorkerMessage, WorkerSpawner, WorkerUnit};

/// Counters observed by the tests.
#[derive(Default)]
pub struct SpawnCounters {
    pub spawned: AtomicUsize,
    pub live: AtomicUsize,
    pub peak_live: AtomicUsize,
    pub killed: AtomicUsize,
    /// Source references in the order their units were spawned.
    pub order: Mutex<Vec<String>>,
}

impl SpawnCounters {
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

/// Spawner whose units behave according to the source reference path:
///
/// - `.../hang` never answers
/// - `.../crash` exits with code 3
/// - `.../error` reports an extraction error
/// - `.../refuse` fails to spawn
/// - anything else sends features after `delay`
pub struct ScriptedSpawner {
    pub counters: Arc<SpawnCounters>,
    pub delay: Duration,
}

impl ScriptedSpawner {
    pub fn new(delay: Duration) -> Self {
        Self {
            counters: Arc::new(SpawnCounters::default()),
            delay,
        }
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(&self, params: &SpawnParams) -> Result<Box<dyn WorkerUnit>, SpawnError> {
        let script = match params.source_ref.rsplit('/').next().unwrap_or_default() {
            "hang" => Script::Hang,
            "crash" => Script::Crash,
            "error" => Script::Error,
            "refuse" => return Err(SpawnError::Other("no capacity on host".into())),
            _ => Script::Features,
        };

        self.counters.spawned.fetch_add(1, Ordering::SeqCst);
        self.counters
            .order
            .lock()
            .unwrap()
            .push(params.source_ref.clone());
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(ScriptedUnit {
            script,
            delay: self.delay,
            counters: self.counters.clone(),
            answered: false,
        }))
    }
}

enum Script {
    Features,
    Error,
    Crash,
    Hang,
}

struct ScriptedUnit {
    script: Script,
    delay: Duration,
    counters: Arc<SpawnCounters>,
    answered: bool,
}

#[async_trait]
impl WorkerUnit for ScriptedUnit {
    async fn next_outcome(&mut self) -> UnitOutcome {
        tokio::time::sleep(self.delay).await;
        if self.answered {
            return std::future::pending().await;
        }
        self.answered = true;
        match self.script {
            Script::Features => UnitOutcome::Message(WorkerMessage::Features(features())),
            Script::Error => UnitOutcome::Message(WorkerMessage::Error {
                reason: "Failed to decode audio".into(),
            }),
            Script::Crash => UnitOutcome::Exited { code: Some(3) },
            Script::Hang => std::future::pending().await,
        }
    }

    async fn kill(&mut self) {
        self.counters.killed.fetch_add(1, Ordering::SeqCst);
    }

    async fn reap(&mut self) -> Option<i32> {
        Some(0)
    }
}

impl Drop for ScriptedUnit {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn features() -> ExtractedFeatures {
    ExtractedFeatures {
        feature_tensor: FeatureTensor::zeros(187, 96),
        energy: 812.5,
        loudness: -14.2,
        tempo: 121.0,
    }
}

/// Engine answering every model with the same two prediction rows.
pub struct FixedEngine {
    pub rows: Vec<Vec<f32>>,
    pub calls: AtomicUsize,
}

impl Default for FixedEngine {
    fn default() -> Self {
        Self {
            rows: vec![vec![0.2, 0.8], vec![0.4, 0.6]],
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl InferenceEngine for FixedEngine {
    async fn load_model(&self, _model: &str) -> Result<(), InferenceError> {
        Ok(())
    }

    async fn predict(
        &self,
        _model: &str,
        _tensor: &FeatureTensor,
    ) -> Result<Vec<Vec<f32>>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.clone())
    }
}

pub fn models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("mood_happy", false),
        ModelSpec::new("mood_sad", true),
    ]
}

/// Everything a test needs to drive and observe one dispatcher.
pub struct Harness {
    pub dispatcher: Dispatcher,
    pub counters: Arc<SpawnCounters>,
    pub cache: Arc<MemoryResultCache>,
    pub queue: Arc<MemoryJobQueue>,
}

pub async fn harness(settings: DispatchSettings, delay: Duration) -> Harness {
    let registry = ModelRegistry::load(Arc::new(FixedEngine::default()), models())
        .await
        .expect("registry should load");
    let spawner = ScriptedSpawner::new(delay);
    let counters = spawner.counters.clone();
    let cache = Arc::new(MemoryResultCache::new());
    let queue = Arc::new(MemoryJobQueue::new());

    let dispatcher = Dispatcher::new(CoordinatorContext {
        settings,
        registry: Arc::new(registry),
        cache: cache.clone(),
        queue: queue.clone(),
        spawner: Arc::new(spawner),
    });

    Harness {
        dispatcher,
        counters,
        cache,
        queue,
    }
}

pub fn fast_settings() -> DispatchSettings {
    DispatchSettings::default()
        .with_job_timeout(Duration::from_secs(5))
        .with_persist_policy(3, Duration::from_millis(1))
}

/// Polls `condition` until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
