//! Feature extraction run inside a worker unit.
//!
//! `FramewiseExtractor` computes mel band log energies per analysis frame
//! (Goertzel filters at mel-spaced centre frequencies over a Hann window)
//! and the scalar metrics attached to every result: energy, loudness and
//! tempo.

use std::f64::consts::PI;

use super::decode::DecodedAudio;
use super::features::{ExtractedFeatures, FeatureTensor, FRAME_SIZE, MEL_BANDS, PATCH_SIZE};
use crate::error::ExtractionError;

/// Hop between analysis frames, in samples.
pub const HOP_SIZE: usize = 1024;

/// Hop of the onset envelope used for tempo estimation, in samples.
const ONSET_HOP: usize = 512;

const MIN_BPM: f64 = 60.0;
const MAX_BPM: f64 = 200.0;

/// Loudness reported for digital silence, in dB.
const SILENCE_DB: f64 = -90.0;

/// Turns decoded audio into the features sent back to the coordinator.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, audio: &DecodedAudio) -> Result<ExtractedFeatures, ExtractionError>;
}

/// Frame-wise mel spectrum extractor.
#[derive(Debug, Clone)]
pub struct FramewiseExtractor {
    frame_size: usize,
    hop_size: usize,
    mel_bands: usize,
}

impl Default for FramewiseExtractor {
    fn default() -> Self {
        Self {
            frame_size: FRAME_SIZE,
            hop_size: HOP_SIZE,
            mel_bands: MEL_BANDS,
        }
    }
}

impl FramewiseExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to change the hop size.
    pub fn with_hop_size(mut self, hop_size: usize) -> Self {
        self.hop_size = hop_size.max(1);
        self
    }

    /// Builder method to change the number of mel bands.
    pub fn with_mel_bands(mut self, mel_bands: usize) -> Self {
        self.mel_bands = mel_bands.max(1);
        self
    }

    fn hann_window(&self) -> Vec<f64> {
        let n = self.frame_size as f64;
        (0..self.frame_size)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1.0)).cos())
            .collect()
    }

    /// Goertzel coefficients for mel-spaced centre frequencies up to Nyquist.
    fn band_coefficients(&self, sample_rate: u32) -> Vec<f64> {
        let nyquist = sample_rate as f64 / 2.0;
        let mel_max = hz_to_mel(nyquist);
        let step = mel_max / (self.mel_bands + 1) as f64;

        (1..=self.mel_bands)
            .map(|band| {
                let centre = mel_to_hz(step * band as f64);
                let bin = (centre * self.frame_size as f64 / sample_rate as f64).round();
                2.0 * (2.0 * PI * bin / self.frame_size as f64).cos()
            })
            .collect()
    }

    fn mel_spectrum(&self, audio: &DecodedAudio) -> Vec<Vec<f32>> {
        let window = self.hann_window();
        let coefficients = self.band_coefficients(audio.sample_rate);
        let mut frame = vec![0.0f64; self.frame_size];
        let mut rows = Vec::new();

        let mut start = 0;
        while start + self.frame_size <= audio.samples.len() {
            for (i, slot) in frame.iter_mut().enumerate() {
                *slot = audio.samples[start + i] as f64 * window[i];
            }

            let row = coefficients
                .iter()
                .map(|&coeff| {
                    let power = goertzel_power(&frame, coeff) / self.frame_size as f64;
                    (1.0 + 10_000.0 * power).log10() as f32
                })
                .collect();
            rows.push(row);

            start += self.hop_size;
        }

        rows
    }
}

impl FeatureExtractor for FramewiseExtractor {
    fn extract(&self, audio: &DecodedAudio) -> Result<ExtractedFeatures, ExtractionError> {
        if audio.samples.len() < self.frame_size {
            return Err(ExtractionError::TooShort {
                samples: audio.samples.len(),
            });
        }

        let mel_spectrum = self.mel_spectrum(audio);

        tracing::debug!(
            frames = mel_spectrum.len(),
            sample_rate = audio.sample_rate,
            duration_secs = audio.duration_secs(),
            "Extracted mel spectrum"
        );

        Ok(ExtractedFeatures {
            feature_tensor: FeatureTensor {
                mel_spectrum,
                frame_size: self.frame_size,
                mel_bands_size: self.mel_bands,
                patch_size: PATCH_SIZE,
            },
            energy: energy(&audio.samples),
            loudness: loudness_db(&audio.samples),
            tempo: estimate_tempo(&audio.samples, audio.sample_rate),
        })
    }
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

fn goertzel_power(frame: &[f64], coeff: f64) -> f64 {
    let (mut s1, mut s2) = (0.0, 0.0);
    for &x in frame {
        let s0 = x + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    (s1 * s1 + s2 * s2 - coeff * s1 * s2).max(0.0)
}

/// Sum of squared samples.
pub fn energy(samples: &[f32]) -> f64 {
    samples.iter().map(|&s| (s as f64) * (s as f64)).sum()
}

/// Mean power in dB, floored at -90 dB.
pub fn loudness_db(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return SILENCE_DB;
    }
    let mean_power = energy(samples) / samples.len() as f64;
    if mean_power <= 0.0 {
        return SILENCE_DB;
    }
    (10.0 * mean_power.log10()).max(SILENCE_DB)
}

/// Estimates tempo in BPM from the autocorrelation of an onset envelope.
///
/// Returns 0.0 when the audio is too short or has no onsets.
pub fn estimate_tempo(samples: &[f32], sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }

    let frame_energy: Vec<f64> = samples
        .chunks_exact(ONSET_HOP)
        .map(|chunk| energy(chunk) / ONSET_HOP as f64)
        .collect();

    // Half-wave rectified energy difference
    let envelope: Vec<f64> = frame_energy
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).max(0.0))
        .collect();

    let frame_rate = sample_rate as f64 / ONSET_HOP as f64;
    let min_lag = (60.0 * frame_rate / MAX_BPM).floor().max(1.0) as usize;
    let max_lag = (60.0 * frame_rate / MIN_BPM).ceil() as usize;

    if envelope.len() <= max_lag + 1 || envelope.iter().all(|&v| v == 0.0) {
        return 0.0;
    }

    let mean = envelope.iter().sum::<f64>() / envelope.len() as f64;
    let centred: Vec<f64> = envelope.iter().map(|v| v - mean).collect();

    // Index is the lag; lag 0 is never a candidate
    let autocorrelation: Vec<f64> = (0..=max_lag + 1)
        .map(|lag| {
            if lag == 0 {
                return 0.0;
            }
            centred[lag..]
                .iter()
                .zip(&centred)
                .map(|(a, b)| a * b)
                .sum::<f64>()
                / (centred.len() - lag) as f64
        })
        .collect();

    let mut best_lag = 0;
    let mut best_score = 0.0;
    for lag in min_lag..=max_lag {
        // Onsets rarely fall on whole frames, so neighbouring lags are pooled
        let pooled = autocorrelation[lag - 1] + autocorrelation[lag] + autocorrelation[lag + 1];
        // Log-Gaussian preference around 120 BPM suppresses octave errors
        let bpm = 60.0 * frame_rate / lag as f64;
        let weight = (-0.5 * (bpm / 120.0).log2().powi(2)).exp();
        let score = pooled * weight;
        if score > best_score {
            best_score = score;
            best_lag = lag;
        }
    }

    if best_lag == 0 {
        return 0.0;
    }

    60.0 * frame_rate / best_lag as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::decode::tests::sine;

    fn click_track(bpm: f64, sample_rate: u32, secs: f64) -> Vec<f32> {
        let n = (sample_rate as f64 * secs) as usize;
        let period = (60.0 / bpm * sample_rate as f64) as usize;
        let click_len = 256;
        (0..n)
            .map(|i| if i % period < click_len { 0.9 } else { 0.0 })
            .collect()
    }

    #[test]
    fn test_energy_and_loudness() {
        let samples = vec![0.5f32; 100];
        assert!((energy(&samples) - 25.0).abs() < 1e-9);
        // mean power 0.25 is about -6 dB
        assert!((loudness_db(&samples) + 6.0206).abs() < 1e-3);
        assert_eq!(loudness_db(&[0.0; 10]), SILENCE_DB);
        assert_eq!(loudness_db(&[]), SILENCE_DB);
    }

    #[test]
    fn test_tempo_of_click_track() {
        let samples = click_track(120.0, 22050, 12.0);
        let bpm = estimate_tempo(&samples, 22050);
        assert!((bpm - 120.0).abs() < 6.0, "estimated {} bpm", bpm);
    }

    #[test]
    fn test_tempo_of_silence_is_zero() {
        assert_eq!(estimate_tempo(&vec![0.0; 44100 * 4], 44100), 0.0);
        assert_eq!(estimate_tempo(&[0.3; 100], 44100), 0.0);
    }

    #[test]
    fn test_extract_geometry() {
        let audio = DecodedAudio {
            samples: sine(1000.0, 16000, 2.0),
            sample_rate: 16000,
        };
        let features = FramewiseExtractor::new().extract(&audio).unwrap();

        let tensor = &features.feature_tensor;
        assert_eq!(tensor.mel_bands_size, MEL_BANDS);
        assert_eq!(tensor.frames(), (32000 - FRAME_SIZE) / HOP_SIZE + 1);
        assert!(tensor.mel_spectrum.iter().all(|row| row.len() == MEL_BANDS));
        assert!(features.energy > 0.0);
    }

    #[test]
    fn test_extract_peaks_near_tone() {
        let audio = DecodedAudio {
            samples: sine(1000.0, 16000, 1.0),
            sample_rate: 16000,
        };
        let features = FramewiseExtractor::new().with_mel_bands(40).extract(&audio).unwrap();
        let row = &features.feature_tensor.mel_spectrum[0];

        let (peak_band, _) = row
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        let centre = mel_to_hz(hz_to_mel(8000.0) / 41.0 * (peak_band + 1) as f64);
        assert!((centre - 1000.0).abs() < 250.0, "peak at {} Hz", centre);
    }

    #[test]
    fn test_extract_rejects_short_audio() {
        let audio = DecodedAudio {
            samples: vec![0.1; 100],
            sample_rate: 16000,
        };
        assert!(matches!(
            FramewiseExtractor::new().extract(&audio),
            Err(ExtractionError::TooShort { samples: 100 })
        ));
    }
}
