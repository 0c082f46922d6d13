//! Inference engine seam and its HTTP implementation.
//!
//! The coordinator never runs models itself: it hands each feature tensor to
//! an `InferenceEngine`. `HttpInferenceEngine` talks to a model server
//! exposing `GET {base}/v1/models/{name}` (load/status) and
//! `POST {base}/v1/models/{name}:predict`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::features::FeatureTensor;
use crate::error::InferenceError;

/// Trait for model inference backends.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Makes sure a model is available, loading it if needed.
    async fn load_model(&self, model: &str) -> Result<(), InferenceError>;

    /// Runs a model over a feature tensor and returns one prediction row per
    /// input patch.
    async fn predict(
        &self,
        model: &str,
        tensor: &FeatureTensor,
    ) -> Result<Vec<Vec<f32>>, InferenceError>;
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    features: &'a FeatureTensor,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    predictions: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: String,
}

/// Client for an HTTP model server.
pub struct HttpInferenceEngine {
    /// Base URL of the model server.
    base_url: String,
    /// HTTP client for making API requests.
    http_client: Client,
}

impl HttpInferenceEngine {
    /// Create a new client for the model server at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `InferenceError::RequestFailed` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, InferenceError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::RequestFailed(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn error_from_response(response: reqwest::Response) -> InferenceError {
        let code = response.status().as_u16();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());

        let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
            .map(|parsed| parsed.error)
            .unwrap_or(error_text);

        InferenceError::ApiError { code, message }
    }
}

#[async_trait]
impl InferenceEngine for HttpInferenceEngine {
    async fn load_model(&self, model: &str) -> Result<(), InferenceError> {
        let url = format!("{}/v1/models/{}", self.base_url, model);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| InferenceError::RequestFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(InferenceError::ModelNotLoaded(model.to_string()));
        }
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        Ok(())
    }

    async fn predict(
        &self,
        model: &str,
        tensor: &FeatureTensor,
    ) -> Result<Vec<Vec<f32>>, InferenceError> {
        let url = format!("{}/v1/models/{}:predict", self.base_url, model);

        let response = self
            .http_client
            .post(&url)
            .json(&PredictRequest { features: tensor })
            .send()
            .await
            .map_err(|e| InferenceError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let parsed: PredictResponse = response.json().await.map_err(|e| {
            InferenceError::ParseError(format!("Failed to parse predict response: {}", e))
        })?;

        Ok(parsed.predictions)
    }
}
