//! Deadline enforcement and outcome classification for worker units.
//!
//! Every dispatched unit is watched until it reaches one terminal outcome:
//!
//! ```text
//! Dispatched ──► Succeeded(features)
//!           ├──► Failed(WorkerError | WorkerCrashed)
//!           └──► TimedOut (unit killed)
//! ```
//!
//! The supervisor only classifies; releasing the concurrency slot belongs to
//! the dispatcher's slot guard.

use std::time::Duration;

use crate::engine::ExtractedFeatures;
use crate::error::JobFailure;
use crate::worker::{UnitOutcome, WorkerMessage, WorkerUnit};

/// Time a unit gets to exit on its own after sending its message.
const REAP_GRACE: Duration = Duration::from_secs(5);

/// Watches one worker unit until its terminal outcome.
///
/// The deadline starts when this is called, which is dispatch time. On
/// expiry the unit is killed and the job fails with `Timeout`. A unit that
/// delivered features is reaped (killed if it lingers past a short grace).
pub async fn supervise(
    unit: &mut dyn WorkerUnit,
    deadline: Duration,
) -> Result<ExtractedFeatures, JobFailure> {
    let outcome = match tokio::time::timeout(deadline, unit.next_outcome()).await {
        Ok(outcome) => outcome,
        Err(_) => {
            unit.kill().await;
            return Err(JobFailure::Timeout(deadline));
        }
    };

    match outcome {
        UnitOutcome::Message(WorkerMessage::Features(features)) => {
            if tokio::time::timeout(REAP_GRACE, unit.reap()).await.is_err() {
                tracing::warn!("Worker lingered after sending features, killing it");
                unit.kill().await;
            }
            Ok(features)
        }
        UnitOutcome::Message(WorkerMessage::Error { reason }) => {
            reap_or_kill(unit).await;
            Err(JobFailure::WorkerError(reason))
        }
        UnitOutcome::Exited { code } => Err(JobFailure::WorkerCrashed { exit_code: code }),
        UnitOutcome::ProtocolViolation(detail) => {
            // The unit may still be alive after writing garbage
            unit.kill().await;
            Err(JobFailure::WorkerError(format!(
                "protocol violation: {}",
                detail
            )))
        }
    }
}

async fn reap_or_kill(unit: &mut dyn WorkerUnit) {
    if tokio::time::timeout(REAP_GRACE, unit.reap()).await.is_err() {
        unit.kill().await;
    }
}
