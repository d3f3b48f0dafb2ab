/// candle-onnx backend
///
/// Evaluates the ONNX graph in pure Rust on the CPU, for hosts without an
/// ONNX Runtime build.

use crate::mfcc::FeatureMatrix;
use crate::model::{Model, ModelError};
use candle_core::{DType, Device as CandleDevice, Tensor};
use candle_onnx::onnx::ModelProto;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Wake-word model evaluated with candle-onnx
pub struct CandleModel {
    graph: Option<ModelProto>,
    input_name: String,
    output_name: String,
}

impl CandleModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let proto = candle_onnx::read_file(path)
            .map_err(|e| ModelError::Load(format!("{}: {e}", path.display())))?;

        let model = Self::from_proto(proto)?;
        info!("candle-onnx model loaded from {} (CPU)", path.display());
        Ok(model)
    }

    /// Wrap an already parsed model
    ///
    /// The first graph input that is not an initializer receives the
    /// features; the first graph output carries the score.
    pub fn from_proto(proto: ModelProto) -> Result<Self, ModelError> {
        let graph = proto
            .graph
            .as_ref()
            .ok_or_else(|| ModelError::Load("model has no graph".to_string()))?;

        let input_name = graph
            .input
            .iter()
            .map(|input| &input.name)
            .find(|name| !graph.initializer.iter().any(|init| &init.name == *name))
            .cloned()
            .ok_or_else(|| ModelError::Load("graph has no inputs".to_string()))?;

        let output_name = graph
            .output
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| ModelError::Load("graph has no outputs".to_string()))?;

        debug!("candle-onnx graph: input={} output={}", input_name, output_name);

        Ok(Self {
            graph: Some(proto),
            input_name,
            output_name,
        })
    }
}

impl Model for CandleModel {
    fn predict(&mut self, features: &FeatureMatrix) -> Result<f32, ModelError> {
        let graph = self
            .graph
            .as_ref()
            .ok_or_else(|| ModelError::Inference("model closed".to_string()))?;

        let (rows, cols) = features.dim();
        let data: Vec<f32> = features.iter().copied().collect();
        let input = Tensor::from_vec(data, (1, rows, cols), &CandleDevice::Cpu)
            .map_err(|e| ModelError::Inference(format!("Failed to build input tensor: {e}")))?;

        let inputs = HashMap::from([(self.input_name.clone(), input)]);
        let mut outputs = candle_onnx::simple_eval(graph, inputs)
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let output = outputs
            .remove(&self.output_name)
            .ok_or_else(|| ModelError::UnexpectedOutputShape(format!("missing output {}", self.output_name)))?;

        let scores = output
            .flatten_all()
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| ModelError::UnexpectedOutputShape(e.to_string()))?;

        scores
            .first()
            .copied()
            .ok_or_else(|| ModelError::UnexpectedOutputShape("empty output tensor".to_string()))
    }

    fn close(&mut self) -> Result<(), ModelError> {
        if self.graph.take().is_some() {
            debug!("candle-onnx graph released");
        }
        Ok(())
    }
}
