/// Wake-word pipeline library
///
/// Streams 16-bit PCM through MFCC feature extraction, a pluggable inference
/// backend, threshold calibration and a debouncing trigger, reporting
/// wake-word activations through callbacks.

pub mod audio;
#[cfg(feature = "candle")]
pub mod candle;
pub mod detector;
pub mod listener;
pub mod mfcc;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod params;
pub mod runner;
pub mod threshold;

// Re-export main types
pub use audio::{AudioBuffer, AudioSample, SAMPLE_RATE};
#[cfg(feature = "candle")]
pub use candle::CandleModel;
pub use detector::{DetectorConfig, DetectorError, TriggerDetector};
pub use listener::{Listener, ListenerError};
pub use mfcc::{extract_mfcc, FeatureMatrix, MfccExtractor};
pub use model::{load_model, BackendConfig, Device, FnModel, Model, ModelError};
#[cfg(feature = "onnx")]
pub use onnx::OnnxModel;
pub use params::{MuStd, Params, ParamsError};
pub use runner::{Runner, RunnerBuilder, RunnerConfig, RunnerError, RunnerStats, WakeWordEvent};
pub use threshold::{ThresholdDecoder, ThresholdError, ThresholdOptions};
