//! Worker unit entry point.
//!
//! Runs inside the worker process: fetch, decode, extract, and answer with
//! exactly one `WorkerMessage`. Never performs inference.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use super::protocol::WorkerMessage;
use super::spawner::SpawnParams;
use crate::engine::{decode_mono, fetch_source, FeatureExtractor};
use crate::error::ExtractionError;

/// Computes the message for one source reference.
///
/// Every failure is caught and turned into `WorkerMessage::Error`.
pub async fn process(params: &SpawnParams, extractor: Arc<dyn FeatureExtractor>) -> WorkerMessage {
    match extract(params, extractor).await {
        Ok(message) => message,
        Err(e) => {
            tracing::error!(source_ref = %params.source_ref, error = %e, "Feature extraction failed");
            WorkerMessage::Error {
                reason: e.to_string(),
            }
        }
    }
}

async fn extract(
    params: &SpawnParams,
    extractor: Arc<dyn FeatureExtractor>,
) -> Result<WorkerMessage, ExtractionError> {
    let source = fetch_source(&params.source_ref).await?;
    let max_memory_mb = params.max_memory_mb;

    // Decoding and extraction are CPU bound
    let features = tokio::task::spawn_blocking(move || {
        let audio = decode_mono(source, max_memory_mb)?;
        extractor.extract(&audio)
    })
    .await
    .map_err(|e| ExtractionError::DecodeFailed(format!("extraction task failed: {}", e)))??;

    tracing::info!(
        source_ref = %params.source_ref,
        frames = features.feature_tensor.frames(),
        tempo = features.tempo,
        "Features extracted"
    );

    Ok(WorkerMessage::Features(features))
}

/// Runs the worker unit and writes its message to stdout.
///
/// # Errors
///
/// Returns an error only if the message cannot be written.
pub async fn run_worker(
    params: SpawnParams,
    extractor: Arc<dyn FeatureExtractor>,
) -> std::io::Result<()> {
    let message = process(&params, extractor).await;
    let line = message.to_line().map_err(std::io::Error::other)?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await
}
