/// ONNX Runtime backend

use crate::mfcc::FeatureMatrix;
use crate::model::{Device, Model, ModelError};
use ort::execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use tracing::{debug, info};

/// Wake-word model loaded from an `.onnx` file
pub struct OnnxModel {
    session: Option<Session>,
}

impl OnnxModel {
    /// Load a model, registering the execution providers for `device`
    ///
    /// TensorRT registers CUDA behind it as a fallback.
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<Self, ModelError> {
        let path = path.as_ref();

        let builder = Session::builder()
            .map_err(|e| ModelError::Load(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| ModelError::Load(format!("Failed to set optimization level: {e}")))?
            .with_intra_threads(1)
            .map_err(|e| ModelError::Load(format!("Failed to set intra threads: {e}")))?;

        let builder = match device {
            Device::Cpu => builder,
            Device::Cuda => builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])
                .map_err(|e| ModelError::Load(format!("Failed to register CUDA: {e}")))?,
            Device::TensorRt => builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default().build(),
                    CUDAExecutionProvider::default().build(),
                ])
                .map_err(|e| ModelError::Load(format!("Failed to register TensorRT: {e}")))?,
        };

        let session = builder
            .commit_from_file(path)
            .map_err(|e| ModelError::Load(format!("{}: {e}", path.display())))?;

        info!("ONNX model loaded from {} ({})", path.display(), device);

        Ok(Self {
            session: Some(session),
        })
    }
}

impl Model for OnnxModel {
    fn predict(&mut self, features: &FeatureMatrix) -> Result<f32, ModelError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ModelError::Inference("model closed".to_string()))?;

        let (rows, cols) = features.dim();
        let data: Vec<f32> = features.iter().copied().collect();
        let input = Tensor::from_array(([1usize, rows, cols], data))
            .map_err(|e| ModelError::Inference(format!("Failed to build input tensor: {e}")))?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::UnexpectedOutputShape(e.to_string()))?;

        scores
            .first()
            .copied()
            .ok_or_else(|| ModelError::UnexpectedOutputShape("empty output tensor".to_string()))
    }

    fn close(&mut self) -> Result<(), ModelError> {
        if self.session.take().is_some() {
            debug!("ONNX session released");
        }
        Ok(())
    }
}
