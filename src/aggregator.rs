//! Model registry and result aggregation.
//!
//! Turns a worker's extracted features into a `WorkResult`: every registered
//! model is run over the feature tensor, its prediction rows are averaged
//! column-wise, scores of inverted-polarity models are flipped, and the
//! first averaged value becomes the model's score.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use ndarray::{Array2, Axis};

use crate::engine::{ExtractedFeatures, FeatureTensor, InferenceEngine, MEL_BANDS, PATCH_SIZE};
use crate::error::{InferenceError, JobFailure};
use crate::metrics::MetricsCollector;
use crate::scheduler::job::{AuxFeatures, TaskKey, WorkResult};

/// A registered model and the polarity of its labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    /// Scores are reported as `1 - x` for inverted models.
    pub inverted: bool,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, inverted: bool) -> Self {
        Self {
            name: name.into(),
            inverted,
        }
    }

    /// Parses a comma-separated model list; a trailing `!` marks inversion.
    ///
    /// Empty entries are skipped.
    pub fn parse_list(raw: &str) -> Vec<ModelSpec> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty() && *entry != "!")
            .map(|entry| match entry.strip_suffix('!') {
                Some(name) => ModelSpec::new(name.trim(), true),
                None => ModelSpec::new(entry, false),
            })
            .collect()
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inverted {
            write!(f, "{}!", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

/// Models loaded once per coordinator, together with the engine running them.
pub struct ModelRegistry {
    engine: Arc<dyn InferenceEngine>,
    models: Vec<ModelSpec>,
}

impl ModelRegistry {
    /// Loads every model and warms it up with an all-zero patch.
    ///
    /// # Errors
    ///
    /// Fails on the first model that cannot be loaded or warmed up.
    pub async fn load(
        engine: Arc<dyn InferenceEngine>,
        models: Vec<ModelSpec>,
    ) -> Result<Self, InferenceError> {
        let warm_up = FeatureTensor::zeros(PATCH_SIZE, MEL_BANDS);

        for model in &models {
            engine.load_model(&model.name).await?;
            engine.predict(&model.name, &warm_up).await?;
            tracing::info!(model = %model.name, inverted = model.inverted, "Model loaded");
        }

        Ok(Self { engine, models })
    }

    pub fn models(&self) -> &[ModelSpec] {
        &self.models
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }
}

/// Column-wise mean of the first two values of every prediction row.
///
/// Returns `None` when there are no rows or a row has fewer than two values.
pub fn two_values_average(rows: &[Vec<f32>]) -> Option<[f64; 2]> {
    if rows.iter().any(|row| row.len() < 2) {
        return None;
    }

    let flat: Vec<f64> = rows
        .iter()
        .flat_map(|row| [row[0] as f64, row[1] as f64])
        .collect();
    let matrix = Array2::from_shape_vec((rows.len(), 2), flat).ok()?;
    let means = matrix.mean_axis(Axis(0))?;

    Some([means[0], means[1]])
}

/// Reported score of a model for its prediction rows.
pub fn model_score(spec: &ModelSpec, rows: &[Vec<f32>]) -> Option<f64> {
    let mut averaged = two_values_average(rows)?;
    if spec.inverted {
        averaged = averaged.map(|value| 1.0 - value);
    }
    Some(averaged[0])
}

/// Runs inference for every registered model and assembles the result.
pub struct ResultAggregator {
    registry: Arc<ModelRegistry>,
    metrics: MetricsCollector,
}

impl ResultAggregator {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Builds the `WorkResult` for a task from its extracted features.
    ///
    /// # Errors
    ///
    /// Returns `JobFailure::InferenceFailure` naming the first model whose
    /// call failed or returned unusable rows.
    pub async fn aggregate(
        &self,
        task_key: &TaskKey,
        features: &ExtractedFeatures,
    ) -> Result<WorkResult, JobFailure> {
        let mut per_model_score = BTreeMap::new();

        for spec in self.registry.models() {
            let started = Instant::now();
            let rows = self
                .registry
                .engine()
                .predict(&spec.name, &features.feature_tensor)
                .await
                .map_err(|e| JobFailure::InferenceFailure {
                    model: spec.name.clone(),
                    reason: e.to_string(),
                })?;
            self.metrics
                .record_inference(&spec.name, started.elapsed().as_secs_f64());

            let score = model_score(spec, &rows).ok_or_else(|| JobFailure::InferenceFailure {
                model: spec.name.clone(),
                reason: InferenceError::EmptyPredictions(spec.name.clone()).to_string(),
            })?;

            tracing::debug!(task_key = %task_key, model = %spec.name, score, "Model scored");
            per_model_score.insert(spec.name.clone(), score);
        }

        Ok(WorkResult {
            task_key: task_key.clone(),
            per_model_score,
            aux_features: AuxFeatures {
                energy: features.energy,
                loudness: features.loudness,
                tempo: features.tempo,
            },
            computed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedEngine {
        rows: Vec<Vec<f32>>,
        loaded: Mutex<Vec<String>>,
        failing_model: Option<String>,
    }

    impl FixedEngine {
        fn new(rows: Vec<Vec<f32>>) -> Self {
            Self {
                rows,
                loaded: Mutex::new(Vec::new()),
                failing_model: None,
            }
        }
    }

    #[async_trait]
    impl InferenceEngine for FixedEngine {
        async fn load_model(&self, model: &str) -> Result<(), InferenceError> {
            self.loaded.lock().unwrap().push(model.to_string());
            Ok(())
        }

        async fn predict(
            &self,
            model: &str,
            _tensor: &FeatureTensor,
        ) -> Result<Vec<Vec<f32>>, InferenceError> {
            if self.failing_model.as_deref() == Some(model) {
                return Err(InferenceError::RequestFailed("connection reset".into()));
            }
            Ok(self.rows.clone())
        }
    }

    fn features() -> ExtractedFeatures {
        ExtractedFeatures {
            feature_tensor: FeatureTensor::zeros(4, 8),
            energy: 12.5,
            loudness: -14.0,
            tempo: 96.0,
        }
    }

    #[test]
    fn test_parse_model_list() {
        let models = ModelSpec::parse_list("danceability, mood_sad!,,mood_relaxed ! , !");
        assert_eq!(
            models,
            vec![
                ModelSpec::new("danceability", false),
                ModelSpec::new("mood_sad", true),
                ModelSpec::new("mood_relaxed", true),
            ]
        );
        assert_eq!(models[1].to_string(), "mood_sad!");
    }

    #[test]
    fn test_two_values_average() {
        let avg = two_values_average(&[vec![0.2, 0.8], vec![0.4, 0.6]]).unwrap();
        assert!((avg[0] - 0.3).abs() < 1e-6);
        assert!((avg[1] - 0.7).abs() < 1e-6);

        assert!(two_values_average(&[]).is_none());
        assert!(two_values_average(&[vec![0.5]]).is_none());
    }

    #[test]
    fn test_mood_axis_inversion() {
        let rows = vec![vec![0.2, 0.8], vec![0.4, 0.6]];

        let sad = model_score(&ModelSpec::new("mood_sad", true), &rows).unwrap();
        let happy = model_score(&ModelSpec::new("mood_happy", false), &rows).unwrap();

        assert!((sad - 0.7).abs() < 1e-6);
        assert!((happy - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_registry_load_warms_up_every_model() {
        let engine = Arc::new(FixedEngine::new(vec![vec![0.5, 0.5]]));
        let registry = ModelRegistry::load(engine.clone(), ModelSpec::parse_list("a,b!"))
            .await
            .unwrap();

        assert_eq!(registry.models().len(), 2);
        assert_eq!(*engine.loaded.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_aggregate_merges_scores_and_aux_features() {
        let engine = Arc::new(FixedEngine::new(vec![vec![0.2, 0.8], vec![0.4, 0.6]]));
        let registry = ModelRegistry::load(engine, ModelSpec::parse_list("mood_happy,mood_sad!"))
            .await
            .unwrap();
        let aggregator = ResultAggregator::new(Arc::new(registry));

        let key = TaskKey::from_source("https://x/a.mp3");
        let result = aggregator.aggregate(&key, &features()).await.unwrap();

        assert_eq!(result.task_key, key);
        assert!((result.per_model_score["mood_happy"] - 0.3).abs() < 1e-6);
        assert!((result.per_model_score["mood_sad"] - 0.7).abs() < 1e-6);
        assert_eq!(result.aux_features.tempo, 96.0);
    }

    #[tokio::test]
    async fn test_aggregate_empty_rows_is_inference_failure() {
        let engine = Arc::new(FixedEngine::new(vec![vec![0.5, 0.5]]));
        let registry = ModelRegistry::load(engine, ModelSpec::parse_list("mood_happy"))
            .await
            .unwrap();
        // Swap to an engine that returns nothing after loading
        let registry = ModelRegistry {
            engine: Arc::new(FixedEngine::new(Vec::new())),
            models: registry.models().to_vec(),
        };
        let aggregator = ResultAggregator::new(Arc::new(registry));

        let err = aggregator
            .aggregate(&TaskKey::from_source("https://x/a.mp3"), &features())
            .await
            .unwrap_err();
        assert!(matches!(err, JobFailure::InferenceFailure { ref model, .. } if model == "mood_happy"));
    }

    #[tokio::test]
    async fn test_aggregate_engine_error_names_model() {
        let mut engine = FixedEngine::new(vec![vec![0.5, 0.5]]);
        engine.failing_model = Some("mood_sad".to_string());
        let registry = ModelRegistry {
            engine: Arc::new(engine),
            models: ModelSpec::parse_list("mood_happy,mood_sad!"),
        };
        let aggregator = ResultAggregator::new(Arc::new(registry));

        let err = aggregator
            .aggregate(&TaskKey::from_source("https://x/a.mp3"), &features())
            .await
            .unwrap_err();
        match err {
            JobFailure::InferenceFailure { model, reason } => {
                assert_eq!(model, "mood_sad");
                assert!(reason.contains("connection reset"));
            }
            other => panic!("unexpected failure: {:?}", other),
        }
    }
}
