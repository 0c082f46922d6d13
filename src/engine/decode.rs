//! Source fetching and audio decoding for worker units.
//!
//! Audio is fetched whole (`http(s)://` through reqwest, `file://` from
//! disk), probed and decoded with symphonia, and reduced to the first
//! channel as `f32` PCM.

use std::io::Cursor;
use std::time::Duration;

use reqwest::Url;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::ExtractionError;

/// Timeout for fetching remote audio.
const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Mono PCM decoded from a source reference.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Raw bytes of a source plus the file extension, if any, used as probe hint.
#[derive(Debug)]
pub struct FetchedSource {
    pub bytes: Vec<u8>,
    pub extension: Option<String>,
}

/// Fetches the raw bytes behind a source reference.
///
/// # Errors
///
/// Returns `ExtractionError::UnsupportedSource` for references that are not
/// `http`, `https` or `file` URLs and `FetchFailed` for transport errors.
pub async fn fetch_source(source_ref: &str) -> Result<FetchedSource, ExtractionError> {
    let url = Url::parse(source_ref.trim())
        .map_err(|_| ExtractionError::UnsupportedSource(source_ref.to_string()))?;

    let extension = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());

    let fetch_failed = |reason: String| ExtractionError::FetchFailed {
        source_ref: source_ref.to_string(),
        reason,
    };

    let bytes = match url.scheme() {
        "http" | "https" => {
            let client = reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .map_err(|e| fetch_failed(e.to_string()))?;

            let response = client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| fetch_failed(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(fetch_failed(format!("HTTP {}", status.as_u16())));
            }

            response
                .bytes()
                .await
                .map_err(|e| fetch_failed(e.to_string()))?
                .to_vec()
        }
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| ExtractionError::UnsupportedSource(source_ref.to_string()))?;
            tokio::fs::read(&path)
                .await
                .map_err(|e| fetch_failed(format!("{}: {}", path.display(), e)))?
        }
        _ => return Err(ExtractionError::UnsupportedSource(source_ref.to_string())),
    };

    tracing::debug!(source_ref = %source_ref, bytes = bytes.len(), "Fetched audio source");

    Ok(FetchedSource { bytes, extension })
}

/// Megabytes needed to hold `samples` decoded `f32` samples, rounded up.
fn required_mb(samples: u64) -> u64 {
    (samples * std::mem::size_of::<f32>() as u64).div_ceil(BYTES_PER_MB)
}

fn check_memory(samples: u64, max_memory_mb: Option<u64>) -> Result<(), ExtractionError> {
    if let Some(limit_mb) = max_memory_mb {
        let required_mb = required_mb(samples);
        if required_mb > limit_mb {
            return Err(ExtractionError::MemoryLimitExceeded {
                required_mb,
                limit_mb,
            });
        }
    }
    Ok(())
}

/// Decodes audio bytes to the first channel as `f32` PCM.
///
/// When `max_memory_mb` is set, audio whose decoded first channel would not
/// fit is rejected, before decoding when the container declares its length.
///
/// # Errors
///
/// Returns `DecodeFailed` when no decodable audio track is found and
/// `MemoryLimitExceeded` when the hint is exceeded.
pub fn decode_mono(
    source: FetchedSource,
    max_memory_mb: Option<u64>,
) -> Result<DecodedAudio, ExtractionError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(source.bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = source.extension.as_deref() {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| ExtractionError::DecodeFailed(format!("unrecognized format: {}", e)))?;

    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| ExtractionError::DecodeFailed("no audio track found".to_string()))?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params.sample_rate.unwrap_or(44100);

    if let Some(frames) = codec_params.n_frames {
        check_memory(frames, max_memory_mb)?;
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| ExtractionError::DecodeFailed(format!("unsupported codec: {}", e)))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(ExtractionError::DecodeFailed(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Corrupt packets are skipped
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!(error = %e, "Skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(ExtractionError::DecodeFailed(e.to_string())),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);

        let buf = sample_buf.get_or_insert_with(|| {
            SampleBuffer::<f32>::new(decoded.capacity() as u64, spec)
        });
        if buf.capacity() < decoded.capacity() * channels {
            *buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        }
        buf.copy_interleaved_ref(decoded);

        samples.extend(buf.samples().iter().step_by(channels).copied());
        check_memory(samples.len() as u64, max_memory_mb)?;
    }

    if samples.is_empty() {
        return Err(ExtractionError::DecodeFailed(
            "audio contains no samples".to_string(),
        ));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a 16-bit PCM WAV file holding `channels` copies of `samples`.
    pub(crate) fn wav_bytes(samples: &[f32], sample_rate: u32, channels: u16) -> Vec<u8> {
        let data_len = (samples.len() * channels as usize * 2) as u32;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            for _ in 0..channels {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        out
    }

    pub(crate) fn sine(freq: f32, sample_rate: u32, secs: f32) -> Vec<f32> {
        let n = (sample_rate as f32 * secs) as usize;
        (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_decode_wav_takes_first_channel() {
        let pcm = sine(440.0, 16000, 1.0);
        let source = FetchedSource {
            bytes: wav_bytes(&pcm, 16000, 2),
            extension: Some("wav".to_string()),
        };

        let audio = decode_mono(source, None).unwrap();
        assert_eq!(audio.sample_rate, 16000);
        assert_eq!(audio.samples.len(), pcm.len());
        assert!((audio.duration_secs() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let source = FetchedSource {
            bytes: b"definitely not audio".to_vec(),
            extension: None,
        };
        assert!(matches!(
            decode_mono(source, None),
            Err(ExtractionError::DecodeFailed(_))
        ));
    }

    #[test]
    fn test_decode_enforces_memory_hint() {
        // 2^19 samples need 2 MB once decoded
        let pcm = vec![0.1f32; 1 << 19];
        let source = FetchedSource {
            bytes: wav_bytes(&pcm, 44100, 1),
            extension: Some("wav".to_string()),
        };

        let err = decode_mono(source, Some(1)).unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::MemoryLimitExceeded {
                required_mb: 2,
                limit_mb: 1
            }
        ));
    }

    #[test]
    fn test_required_mb_rounds_up() {
        assert_eq!(required_mb(0), 0);
        assert_eq!(required_mb(1), 1);
        assert_eq!(required_mb(262_144), 1);
        assert_eq!(required_mb(262_145), 2);
    }

    #[tokio::test]
    async fn test_fetch_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        std::fs::write(&path, wav_bytes(&sine(220.0, 8000, 0.5), 8000, 1)).unwrap();

        let url = Url::from_file_path(&path).unwrap();
        let fetched = fetch_source(url.as_str()).await.unwrap();
        assert_eq!(fetched.extension.as_deref(), Some("wav"));
        assert!(!fetched.bytes.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_rejects_unknown_scheme() {
        assert!(matches!(
            fetch_source("ftp://example.com/a.mp3").await,
            Err(ExtractionError::UnsupportedSource(_))
        ));
        assert!(matches!(
            fetch_source("not a url").await,
            Err(ExtractionError::UnsupportedSource(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_missing_file() {
        assert!(matches!(
            fetch_source("file:///nonexistent/mood-forge/clip.wav").await,
            Err(ExtractionError::FetchFailed { .. })
        ));
    }
}
