/// MFCC feature extraction
///
/// Turns a run of 16-bit PCM into a matrix of mel-frequency cepstral
/// coefficients, one row per analysis window. Every row depends only on the
/// samples of its own window, so extracting a long run at once or in
/// hop-aligned pieces yields identical rows.

use crate::audio::{AudioSample, SAMPLE_SCALE};
use crate::params::Params;
use ndarray::Array2;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;
use tracing::debug;

/// Feature matrix, shape `(rows, n_mfcc)`, rows oldest first
pub type FeatureMatrix = Array2<f32>;

/// Floor applied to filterbank energies before taking the log
const LOG_FLOOR: f32 = 1e-10;

/// MFCC extractor with precomputed FFT plan, window, filterbank and DCT basis
pub struct MfccExtractor {
    window_samples: usize,
    hop_samples: usize,
    n_mfcc: usize,
    fft_len: usize,
    fft: Arc<dyn Fft<f32>>,
    hamming: Vec<f32>,
    filter_bank: Vec<Vec<f32>>, // [filter][spectrum bin]
    dct: Vec<Vec<f32>>,         // [coefficient][filter]
}

impl MfccExtractor {
    pub fn new(params: &Params) -> Self {
        let window_samples = params.window_samples().max(1);
        let hop_samples = params.hop_samples().max(1);
        let fft_len = params.n_fft.max(window_samples).next_power_of_two();

        debug!(
            "MFCC extractor: window={} hop={} fft={} filters={} coeffs={}",
            window_samples, hop_samples, fft_len, params.n_filt, params.n_mfcc
        );

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_len);

        let hamming = (0..window_samples)
            .map(|n| {
                if window_samples == 1 {
                    1.0
                } else {
                    0.54 - 0.46 * (2.0 * PI * n as f32 / (window_samples - 1) as f32).cos()
                }
            })
            .collect();

        Self {
            window_samples,
            hop_samples,
            n_mfcc: params.n_mfcc,
            fft_len,
            fft,
            hamming,
            filter_bank: mel_filter_bank(params.sample_rate, fft_len, params.n_filt),
            dct: dct_basis(params.n_mfcc, params.n_filt),
        }
    }

    /// Number of rows `extract` produces for `len` samples
    pub fn rows_for(&self, len: usize) -> usize {
        if len < self.window_samples {
            0
        } else {
            1 + (len - self.window_samples) / self.hop_samples
        }
    }

    pub fn window_samples(&self) -> usize {
        self.window_samples
    }

    pub fn hop_samples(&self) -> usize {
        self.hop_samples
    }

    /// Extract one feature row per window of `audio`
    ///
    /// Fewer samples than one window yields a matrix with zero rows.
    pub fn extract(&self, audio: &[AudioSample]) -> FeatureMatrix {
        let rows = self.rows_for(audio.len());
        let mut features = FeatureMatrix::zeros((rows, self.n_mfcc));

        let mut spectrum = vec![Complex32::new(0.0, 0.0); self.fft_len];
        let mut power = vec![0f32; self.fft_len / 2 + 1];
        let mut energies = vec![0f32; self.filter_bank.len()];

        for (row, mut out) in features.rows_mut().into_iter().enumerate() {
            let start = row * self.hop_samples;
            let frame = &audio[start..start + self.window_samples];

            // 1) Normalize, window, zero-pad
            for (dst, (&s, &w)) in spectrum.iter_mut().zip(frame.iter().zip(&self.hamming)) {
                *dst = Complex32::new(s as f32 * SAMPLE_SCALE * w, 0.0);
            }
            for dst in spectrum.iter_mut().skip(self.window_samples) {
                *dst = Complex32::new(0.0, 0.0);
            }
            self.fft.process(&mut spectrum);

            // 2) Power spectrum
            let scale = 1.0 / self.fft_len as f32;
            for (p, c) in power.iter_mut().zip(&spectrum) {
                *p = c.norm_sqr() * scale;
            }

            // 3) Log mel energies
            for (e, filter) in energies.iter_mut().zip(&self.filter_bank) {
                let sum: f32 = filter.iter().zip(&power).map(|(f, p)| f * p).sum();
                *e = sum.max(LOG_FLOOR).ln();
            }

            // 4) DCT-II
            for (c, basis) in out.iter_mut().zip(&self.dct) {
                *c = basis.iter().zip(&energies).map(|(b, e)| b * e).sum();
            }
        }

        features
    }
}

/// Extract features for `audio` with a one-off extractor
pub fn extract_mfcc(audio: &[AudioSample], params: &Params) -> FeatureMatrix {
    MfccExtractor::new(params).extract(audio)
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular filters evenly spaced on the mel scale from 0 Hz to Nyquist
fn mel_filter_bank(sample_rate: usize, fft_len: usize, n_filt: usize) -> Vec<Vec<f32>> {
    let n_bins = fft_len / 2 + 1;
    let mel_high = hz_to_mel(sample_rate as f32 / 2.0);

    let bins: Vec<usize> = (0..n_filt + 2)
        .map(|i| {
            let hz = mel_to_hz(mel_high * i as f32 / (n_filt + 1) as f32);
            let bin = ((fft_len + 1) as f32 * hz / sample_rate as f32).floor() as usize;
            bin.min(n_bins - 1)
        })
        .collect();

    (0..n_filt)
        .map(|m| {
            let (left, center, right) = (bins[m], bins[m + 1], bins[m + 2]);
            let mut filter = vec![0f32; n_bins];

            for k in left..center {
                filter[k] = (k - left) as f32 / (center - left) as f32;
            }
            for k in center..right {
                filter[k] = (right - k) as f32 / (right - center) as f32;
            }
            if center == right {
                filter[center] = 1.0;
            }
            filter
        })
        .collect()
}

/// Orthonormal DCT-II basis truncated to the first `n_mfcc` coefficients
fn dct_basis(n_mfcc: usize, n_filt: usize) -> Vec<Vec<f32>> {
    let n = n_filt as f32;
    (0..n_mfcc)
        .map(|k| {
            let norm = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
            (0..n_filt)
                .map(|m| norm * (PI * k as f32 * (m as f32 + 0.5) / n).cos())
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, freq: f32, amplitude: f32) -> Vec<AudioSample> {
        (0..len)
            .map(|i| {
                let t = i as f32 / 16000.0;
                (amplitude * (2.0 * PI * freq * t).sin() * i16::MAX as f32) as i16
            })
            .collect()
    }

    #[test]
    fn test_row_count() {
        let params = Params::default();
        let extractor = MfccExtractor::new(&params);

        assert_eq!(extractor.extract(&vec![0; 1599]).nrows(), 0);
        assert_eq!(extractor.extract(&vec![0; 1600]).nrows(), 1);
        assert_eq!(extractor.extract(&vec![0; 2399]).nrows(), 1);
        assert_eq!(extractor.extract(&vec![0; 2400]).nrows(), 2);

        let full = extractor.extract(&vec![0; params.buffer_samples()]);
        assert_eq!(full.dim(), (params.n_features(), params.n_mfcc));
    }

    #[test]
    fn test_too_short_yields_empty_matrix() {
        let features = extract_mfcc(&[1, 2, 3], &Params::default());
        assert_eq!(features.dim(), (0, 13));
    }

    #[test]
    fn test_rows_are_independent_of_offset() {
        let params = Params::default();
        let extractor = MfccExtractor::new(&params);
        let audio = tone(4000, 440.0, 0.3);

        let all = extractor.extract(&audio);
        let tail = extractor.extract(&audio[800..]);

        assert_eq!(all.row(1), tail.row(0));
        assert_eq!(all.row(2), tail.row(1));
    }

    #[test]
    fn test_features_are_finite_and_distinguish_signals() {
        let params = Params::default();
        let extractor = MfccExtractor::new(&params);

        let silence = extractor.extract(&vec![0; 1600]);
        let loud = extractor.extract(&tone(1600, 1000.0, 0.5));

        assert!(silence.iter().all(|v| v.is_finite()));
        assert!(loud.iter().all(|v| v.is_finite()));
        // Energy lands in the 0th cepstral coefficient
        assert!(loud[[0, 0]] > silence[[0, 0]]);
    }

    #[test]
    fn test_filter_bank_shape() {
        let bank = mel_filter_bank(16000, 2048, 20);
        assert_eq!(bank.len(), 20);
        assert!(bank.iter().all(|f| f.len() == 1025));
        assert!(bank.iter().all(|f| f.iter().any(|&v| v > 0.0)));
    }
}
