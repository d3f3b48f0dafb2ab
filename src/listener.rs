/// Listener module
///
/// Keeps a rolling window of MFCC features over the incoming audio and runs
/// the model on it. Each update only extracts the rows the new audio
/// completes; older rows are shifted out so the matrix always covers the
/// most recent `buffer_t` seconds.

use crate::audio::{AudioBuffer, AudioSample};
use crate::mfcc::{FeatureMatrix, MfccExtractor};
use crate::model::{Model, ModelError};
use crate::params::{Params, ParamsError};
use crate::threshold::{ThresholdDecoder, ThresholdError};
use ndarray::s;
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Model unavailable: listener has been closed")]
    ModelUnavailable,

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Invalid params: {0}")]
    Params(#[from] ParamsError),

    #[error("Invalid threshold config: {0}")]
    Threshold(#[from] ThresholdError),
}

/// Rolling feature window in front of a model
pub struct Listener {
    params: Params,
    model: Option<Box<dyn Model>>,
    extractor: MfccExtractor,
    window_audio: AudioBuffer,
    mfccs: FeatureMatrix,
    decoder: ThresholdDecoder,
}

impl Listener {
    /// Create a listener; the decoder is centered on `params.threshold_center`
    pub fn new(model: Box<dyn Model>, params: Params) -> Result<Self, ListenerError> {
        params.validate()?;

        let decoder = ThresholdDecoder::new(&params.threshold_config, params.threshold_options())?;
        let extractor = MfccExtractor::new(&params);

        info!(
            "Listener ready: {} feature rows x {} coefficients over {} samples",
            params.n_features(),
            params.n_mfcc,
            params.buffer_samples()
        );

        Ok(Self {
            window_audio: AudioBuffer::with_capacity(params.window_samples() * 2),
            mfccs: FeatureMatrix::zeros((params.n_features(), params.n_mfcc)),
            model: Some(model),
            extractor,
            decoder,
            params,
        })
    }

    /// Append audio and return the updated feature window
    ///
    /// The window is returned unchanged until a full analysis window of
    /// audio has accumulated.
    pub fn update_vectors(&mut self, audio: &[AudioSample]) -> &FeatureMatrix {
        self.window_audio.write(audio);

        if self.window_audio.len() >= self.extractor.window_samples() {
            let mut new_features = self.extractor.extract(self.window_audio.as_slice());
            let produced = new_features.nrows();
            self.window_audio.consume(produced * self.extractor.hop_samples());

            let target = self.mfccs.nrows();
            if new_features.nrows() > target {
                new_features = new_features.slice(s![produced - target.., ..]).to_owned();
            }

            let n = new_features.nrows();
            if n == target {
                self.mfccs = new_features;
            } else {
                let mut merged = FeatureMatrix::zeros(self.mfccs.raw_dim());
                merged.slice_mut(s![..target - n, ..]).assign(&self.mfccs.slice(s![n.., ..]));
                merged.slice_mut(s![target - n.., ..]).assign(&new_features);
                self.mfccs = merged;
            }

            trace!(
                "Extracted {} feature rows, {} samples pending",
                produced,
                self.window_audio.len()
            );
        }

        &self.mfccs
    }

    /// Feed audio through features, model and decoder
    ///
    /// Returns the calibrated probability for the current window.
    pub fn update(&mut self, audio: &[AudioSample]) -> Result<f32, ListenerError> {
        if self.model.is_none() {
            return Err(ListenerError::ModelUnavailable);
        }

        self.update_vectors(audio);

        let model = self.model.as_mut().ok_or(ListenerError::ModelUnavailable)?;
        let raw_output = model.predict(&self.mfccs)?;
        let prob = self.decoder.decode(raw_output);

        trace!("raw={:.4} prob={:.4}", raw_output, prob);

        Ok(prob)
    }

    /// Release the model; later updates fail with `ModelUnavailable`
    pub fn close(&mut self) -> Result<(), ListenerError> {
        if let Some(model) = self.model.as_mut() {
            model.close()?;
            self.model = None;
            info!("Listener model released");
        }
        Ok(())
    }

    /// Drop pending audio and zero the feature window
    pub fn reset(&mut self) {
        self.window_audio.clear();
        self.mfccs.fill(0.0);
        debug!("Listener reset");
    }

    pub fn is_closed(&self) -> bool {
        self.model.is_none()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn decoder(&self) -> &ThresholdDecoder {
        &self.decoder
    }

    /// Current feature window
    pub fn features(&self) -> &FeatureMatrix {
        &self.mfccs
    }

    /// Samples waiting for the next full window
    pub fn pending_samples(&self) -> usize {
        self.window_audio.len()
    }
}
