//! Message protocol between a worker unit and the coordinator.
//!
//! A worker unit writes exactly one `WorkerMessage` to stdout, serialized as
//! a single JSON line, and exits. Anything else on stdout is a protocol
//! violation.

use serde::{Deserialize, Serialize};

use crate::engine::ExtractedFeatures;

/// The single message a worker unit sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Extraction succeeded.
    Features(ExtractedFeatures),
    /// Extraction failed with a caught error.
    Error { reason: String },
}

impl WorkerMessage {
    /// Serializes the message as one newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parses one stdout line.
    ///
    /// # Errors
    ///
    /// Returns a description of the violation for malformed JSON or an
    /// unknown message type.
    pub fn parse_line(line: &str) -> Result<Self, String> {
        serde_json::from_str(line.trim()).map_err(|e| {
            let preview: String = line.trim().chars().take(80).collect();
            format!("unparseable message '{}': {}", preview, e)
        })
    }
}
