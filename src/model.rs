/// Inference backend module
///
/// The pipeline only ever sees a `Box<dyn Model>`: one raw score per feature
/// matrix, and an idempotent `close`. Which engine sits behind it is decided
/// once, at construction, through `BackendConfig`.

use crate::mfcc::FeatureMatrix;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model load failed: {0}")]
    Load(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Model release failed: {0}")]
    Release(String),

    #[error("Unexpected model output: {0}")]
    UnexpectedOutputShape(String),

    #[error("Backend not compiled in: {0}")]
    BackendUnavailable(&'static str),
}

/// Wake-word inference backend
#[cfg_attr(test, mockall::automock)]
pub trait Model: Send {
    /// Run one forward pass over a `(rows, n_mfcc)` feature matrix
    fn predict(&mut self, features: &FeatureMatrix) -> Result<f32, ModelError>;

    /// Release backend resources; calling it again is a no-op
    fn close(&mut self) -> Result<(), ModelError>;
}

/// Backend wrapping a scoring closure
///
/// Lets any inference engine that can score a feature matrix plug into the
/// pipeline without its own `Model` impl.
pub struct FnModel<F> {
    score: Option<F>,
}

impl<F> FnModel<F>
where
    F: FnMut(&FeatureMatrix) -> Result<f32, ModelError> + Send,
{
    pub fn new(score: F) -> Self {
        Self { score: Some(score) }
    }
}

impl<F> Model for FnModel<F>
where
    F: FnMut(&FeatureMatrix) -> Result<f32, ModelError> + Send,
{
    fn predict(&mut self, features: &FeatureMatrix) -> Result<f32, ModelError> {
        match self.score.as_mut() {
            Some(score) => score(features),
            None => Err(ModelError::Inference("model closed".to_string())),
        }
    }

    fn close(&mut self) -> Result<(), ModelError> {
        self.score = None;
        Ok(())
    }
}

/// Execution device for file-backed models
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    TensorRt,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Cuda => write!(f, "CUDA"),
            Device::TensorRt => write!(f, "TensorRT"),
        }
    }
}

/// Backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    /// ONNX model file run through ONNX Runtime
    Onnx { path: PathBuf, device: Device },

    /// ONNX model file evaluated by candle-onnx (CPU only)
    Candle { path: PathBuf },
}

/// Load the backend described by `config`
pub fn load_model(config: &BackendConfig) -> Result<Box<dyn Model>, ModelError> {
    match config {
        BackendConfig::Onnx { path, device } => {
            info!("Loading ONNX model {} on {}", path.display(), device);
            load_onnx(path, *device)
        }
        BackendConfig::Candle { path } => {
            info!("Loading candle-onnx model {}", path.display());
            load_candle(path)
        }
    }
}

#[cfg(feature = "onnx")]
fn load_onnx(path: &std::path::Path, device: Device) -> Result<Box<dyn Model>, ModelError> {
    Ok(Box::new(crate::onnx::OnnxModel::load(path, device)?))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(_path: &std::path::Path, _device: Device) -> Result<Box<dyn Model>, ModelError> {
    Err(ModelError::BackendUnavailable("onnx"))
}

#[cfg(feature = "candle")]
fn load_candle(path: &std::path::Path) -> Result<Box<dyn Model>, ModelError> {
    Ok(Box::new(crate::candle::CandleModel::load(path)?))
}

#[cfg(not(feature = "candle"))]
fn load_candle(_path: &std::path::Path) -> Result<Box<dyn Model>, ModelError> {
    Err(ModelError::BackendUnavailable("candle"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_model_scores_features() {
        let mut model = FnModel::new(|features: &FeatureMatrix| Ok(features.sum()));
        let features = FeatureMatrix::from_elem((2, 3), 0.5);

        assert_eq!(model.predict(&features).unwrap(), 3.0);
    }

    #[test]
    fn test_fn_model_close_is_idempotent() {
        let mut model = FnModel::new(|_: &FeatureMatrix| Ok(0.5));
        model.close().unwrap();
        model.close().unwrap();

        assert!(matches!(
            model.predict(&FeatureMatrix::zeros((1, 13))),
            Err(ModelError::Inference(_))
        ));
    }

    #[test]
    fn test_fn_model_propagates_errors() {
        let mut model =
            FnModel::new(|_: &FeatureMatrix| Err(ModelError::UnexpectedOutputShape("[]".to_string())));
        assert!(matches!(
            model.predict(&FeatureMatrix::zeros((1, 13))),
            Err(ModelError::UnexpectedOutputShape(_))
        ));
    }

    #[test]
    fn test_backend_config_json() {
        let config: BackendConfig =
            serde_json::from_str(r#"{"backend": "onnx", "path": "hey.onnx", "device": "cuda"}"#).unwrap();
        assert_eq!(
            config,
            BackendConfig::Onnx {
                path: PathBuf::from("hey.onnx"),
                device: Device::Cuda,
            }
        );
        assert_eq!(Device::TensorRt.to_string(), "TensorRT");

        let config: BackendConfig =
            serde_json::from_str(r#"{"backend": "candle", "path": "hey.onnx"}"#).unwrap();
        assert_eq!(config, BackendConfig::Candle { path: PathBuf::from("hey.onnx") });
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn test_missing_backend_fails_synchronously() {
        let config = BackendConfig::Onnx {
            path: PathBuf::from("missing.onnx"),
            device: Device::Cpu,
        };
        assert!(matches!(
            load_model(&config),
            Err(ModelError::BackendUnavailable("onnx"))
        ));
    }

    #[cfg(not(feature = "candle"))]
    #[test]
    fn test_missing_candle_backend_fails_synchronously() {
        let config = BackendConfig::Candle {
            path: PathBuf::from("missing.onnx"),
        };
        assert!(matches!(
            load_model(&config),
            Err(ModelError::BackendUnavailable("candle"))
        ));
    }

    #[cfg(feature = "candle")]
    #[test]
    fn test_candle_backend_selected() {
        let config = BackendConfig::Candle {
            path: PathBuf::from("missing.onnx"),
        };
        assert!(matches!(load_model(&config), Err(ModelError::Load(_))));
    }
}
