//! Audio analysis collaborators.
//!
//! - `decode`: fetching a source reference and decoding it to mono PCM
//! - `extractor`: mel spectrum and scalar metrics, run inside worker units
//! - `features`: the payload a worker unit sends back
//! - `inference`: model inference, run on the coordinator

pub mod decode;
pub mod extractor;
pub mod features;
pub mod inference;

pub use decode::{decode_mono, fetch_source, DecodedAudio, FetchedSource};
pub use extractor::{FeatureExtractor, FramewiseExtractor};
pub use features::{ExtractedFeatures, FeatureTensor, MEL_BANDS, PATCH_SIZE};
pub use inference::{HttpInferenceEngine, InferenceEngine};
