//! Feature payload produced by a worker unit and consumed by inference.

use serde::{Deserialize, Serialize};

/// Number of mel bands the mood models expect.
pub const MEL_BANDS: usize = 96;

/// Number of frames per model input patch.
pub const PATCH_SIZE: usize = 187;

/// Analysis frame length in samples.
pub const FRAME_SIZE: usize = 512;

/// Frame-wise mel band energies plus the geometry the models expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureTensor {
    /// One row of `mel_bands_size` log energies per analysis frame.
    pub mel_spectrum: Vec<Vec<f32>>,
    pub frame_size: usize,
    pub mel_bands_size: usize,
    pub patch_size: usize,
}

impl FeatureTensor {
    /// All-zero tensor with `frames` rows, used to warm models up.
    pub fn zeros(frames: usize, mel_bands: usize) -> Self {
        Self {
            mel_spectrum: vec![vec![0.0; mel_bands]; frames],
            frame_size: FRAME_SIZE,
            mel_bands_size: mel_bands,
            patch_size: PATCH_SIZE,
        }
    }

    /// Number of analysis frames.
    pub fn frames(&self) -> usize {
        self.mel_spectrum.len()
    }
}

/// Everything a worker unit computes for one source reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFeatures {
    pub feature_tensor: FeatureTensor,
    pub energy: f64,
    pub loudness: f64,
    pub tempo: f64,
}
