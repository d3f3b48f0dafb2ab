/// Model parameter module
///
/// Holds the audio and feature parameters a wake-word model was trained with,
/// and derives the sample counts used by every stage of the pipeline.

use crate::threshold::{ThresholdDecoder, ThresholdOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("Failed to read params file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse params: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid params: {0}")]
    Invalid(String),
}

/// Gaussian mixture over raw model scores, as `(mean, std)` pairs.
///
/// Serialized as a list of two-element lists, e.g. `[[6, 4]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MuStd(Vec<(f32, f32)>);

impl MuStd {
    pub fn new(pairs: Vec<(f32, f32)>) -> Self {
        Self(pairs)
    }

    /// `mean + z * std` for every component
    pub fn calculate(&self, z: f32) -> Vec<f32> {
        self.0.iter().map(|&(mu, std)| mu + z * std).collect()
    }

    /// Lowest `mean + z * std` over all components
    pub fn min(&self, z: f32) -> f32 {
        self.calculate(z).into_iter().fold(f32::INFINITY, f32::min)
    }

    /// Highest `mean + z * std` over all components
    pub fn max(&self, z: f32) -> f32 {
        self.calculate(z).into_iter().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(f32, f32)> {
        self.0.iter()
    }
}

impl Default for MuStd {
    fn default() -> Self {
        Self(vec![(6.0, 4.0)])
    }
}

/// Parameters describing how audio is turned into model input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Analysis window duration (seconds)
    pub window_t: f32,

    /// Hop between consecutive windows (seconds)
    pub hop_t: f32,

    /// Duration of audio covered by one feature matrix (seconds)
    pub buffer_t: f32,

    /// Sample rate (Hz)
    pub sample_rate: usize,

    /// Bytes per sample
    pub sample_depth: usize,

    /// Cepstral coefficients per feature row
    pub n_mfcc: usize,

    /// Mel filterbank channels
    pub n_filt: usize,

    /// Minimum FFT size
    pub n_fft: usize,

    /// Reserved: delta features are not computed by this pipeline
    pub use_delta: bool,

    /// Raw score distribution used to calibrate the output
    pub threshold_config: MuStd,

    /// Calibrated probability mapped to 0.5
    pub threshold_center: f32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            window_t: 0.1,
            hop_t: 0.05,
            buffer_t: 1.5,
            sample_rate: 16000,
            sample_depth: 2,
            n_mfcc: 13,
            n_filt: 20,
            n_fft: 512,
            use_delta: false,
            threshold_config: MuStd::default(),
            threshold_center: 0.2,
        }
    }
}

impl Params {
    /// Parse params from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ParamsError> {
        let params: Params = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// Load params from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ParamsError> {
        let path = path.as_ref();
        debug!("Loading params from {}", path.display());

        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Validate parameters
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.sample_rate == 0 {
            return Err(ParamsError::Invalid("sample_rate must be greater than 0".to_string()));
        }

        if !(self.hop_t > 0.0 && self.window_t >= self.hop_t && self.buffer_t >= self.window_t) {
            return Err(ParamsError::Invalid(
                "durations must satisfy 0 < hop_t <= window_t <= buffer_t".to_string()
            ));
        }

        if self.hop_samples() == 0 {
            return Err(ParamsError::Invalid(
                "hop_t is shorter than one sample".to_string()
            ));
        }

        if self.n_mfcc == 0 || self.n_filt == 0 {
            return Err(ParamsError::Invalid(
                "n_mfcc and n_filt must be greater than 0".to_string()
            ));
        }

        if self.n_mfcc > self.n_filt {
            return Err(ParamsError::Invalid(format!(
                "n_mfcc ({}) cannot exceed n_filt ({})",
                self.n_mfcc, self.n_filt
            )));
        }

        if self.threshold_config.is_empty() {
            return Err(ParamsError::Invalid("threshold_config is empty".to_string()));
        }

        if self.threshold_config.iter().any(|&(mu, std)| !mu.is_finite() || !(std >= 0.0)) {
            return Err(ParamsError::Invalid(
                "threshold_config needs finite means and non-negative stds".to_string()
            ));
        }

        if !(self.threshold_center > 0.0 && self.threshold_center < 1.0) {
            return Err(ParamsError::Invalid(
                "threshold_center must be between 0.0 and 1.0 (exclusive)".to_string()
            ));
        }

        if self.n_features() == 0 {
            return Err(ParamsError::Invalid(
                "buffer_t is too short to hold one window".to_string()
            ));
        }

        ThresholdDecoder::table_len(&self.threshold_config, &self.threshold_options())
            .map_err(|e| ParamsError::Invalid(format!("threshold_config: {}", e)))?;

        Ok(())
    }

    /// Decoder options centered on `threshold_center`
    pub fn threshold_options(&self) -> ThresholdOptions {
        ThresholdOptions {
            center: self.threshold_center,
            ..Default::default()
        }
    }

    /// Samples in one feature matrix, rounded down to a whole number of hops
    pub fn buffer_samples(&self) -> usize {
        let samples = round_half_up(self.sample_rate as f32 * self.buffer_t);
        let hop = self.hop_samples();
        if hop == 0 {
            return 0;
        }
        hop * (samples / hop)
    }

    /// Rows in one feature matrix
    pub fn n_features(&self) -> usize {
        let buffer = self.buffer_samples();
        let window = self.window_samples();
        let hop = self.hop_samples();
        if hop == 0 || buffer < window {
            return 0;
        }
        1 + (buffer - window) / hop
    }

    /// Samples in one analysis window
    pub fn window_samples(&self) -> usize {
        round_half_up(self.sample_rate as f32 * self.window_t)
    }

    /// Samples between the starts of consecutive windows
    pub fn hop_samples(&self) -> usize {
        round_half_up(self.sample_rate as f32 * self.hop_t)
    }
}

/// Nearest-integer rounding as `floor(x + 0.5)`
fn round_half_up(x: f32) -> usize {
    (x + 0.5).floor().max(0.0) as usize
}
