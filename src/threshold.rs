/// Threshold decoder module
///
/// Calibrates raw network output against the score distribution the model
/// produced on positive samples during training. The distribution is a
/// Gaussian mixture (`MuStd`); its cumulative density is tabulated once at
/// construction and only read afterwards, so a decoder can be shared freely
/// between threads.

use crate::params::MuStd;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use thiserror::Error;
use tracing::debug;

/// Largest calibration table a decoder will allocate
pub const MAX_TABLE_LEN: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum ThresholdError {
    #[error("Threshold config has no components")]
    Empty,

    #[error("Threshold bounds out of range: {0}")]
    Bounds(String),

    #[error("Calibration table too large: {len} entries (max {max})", max = MAX_TABLE_LEN)]
    TableTooLarge { len: u64 },
}

/// Options controlling the calibration table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdOptions {
    /// Lower bound of the table, in standard deviations (negative)
    pub min_z: f32,

    /// Upper bound of the table, in standard deviations (positive)
    pub max_z: f32,

    /// Cumulative probability mapped to 0.5
    pub center: f32,

    /// Table entries per unit of raw score
    pub resolution: usize,
}

impl Default for ThresholdOptions {
    fn default() -> Self {
        Self {
            min_z: -4.0,
            max_z: 4.0,
            center: 0.5,
            resolution: 200,
        }
    }
}

/// Integer support of the raw score and the table size it implies
#[derive(Debug, Clone, Copy)]
struct Support {
    min_out: i64,
    max_out: i64,
    out_range: i64,
    table_len: usize,
}

impl Support {
    fn new(mu_stds: &MuStd, options: &ThresholdOptions) -> Result<Self, ThresholdError> {
        if mu_stds.is_empty() {
            return Err(ThresholdError::Empty);
        }

        let low = mu_stds.min(options.min_z).floor();
        let high = mu_stds.max(options.max_z).floor();
        if !low.is_finite() || !high.is_finite() {
            return Err(ThresholdError::Bounds(format!("[{}, {}]", low, high)));
        }

        // Casts saturate; an overflowing range is caught below
        let (min_out, max_out) = (low as i64, high as i64);
        let out_range = max_out
            .checked_sub(min_out)
            .filter(|range| *range >= 0)
            .ok_or_else(|| ThresholdError::Bounds(format!("[{}, {}]", min_out, max_out)))?;

        let len = (options.resolution as u64)
            .checked_mul(out_range as u64)
            .unwrap_or(u64::MAX);
        if len > MAX_TABLE_LEN as u64 {
            return Err(ThresholdError::TableTooLarge { len });
        }

        Ok(Self {
            min_out,
            max_out,
            out_range,
            table_len: len as usize,
        })
    }
}

/// Maps raw network output to a calibrated probability
#[derive(Debug, Clone)]
pub struct ThresholdDecoder {
    options: ThresholdOptions,
    min_out: i64,
    max_out: i64,
    out_range: i64,
    cd: Vec<f32>,
}

impl ThresholdDecoder {
    pub fn new(mu_stds: &MuStd, options: ThresholdOptions) -> Result<Self, ThresholdError> {
        let support = Support::new(mu_stds, &options)?;

        let mut cumulative = 0f32;
        let cd = probability_density(mu_stds, &options, &support)
            .into_iter()
            .map(|p| {
                cumulative += p;
                cumulative
            })
            .collect::<Vec<_>>();

        debug!(
            "Threshold decoder: out=[{}, {}], table={} entries, center={}",
            support.min_out,
            support.max_out,
            cd.len(),
            options.center
        );

        Ok(Self {
            options,
            min_out: support.min_out,
            max_out: support.max_out,
            out_range: support.out_range,
            cd,
        })
    }

    /// Size of the table `new` would build, or why it cannot build one
    pub fn table_len(mu_stds: &MuStd, options: &ThresholdOptions) -> Result<usize, ThresholdError> {
        Support::new(mu_stds, options).map(|support| support.table_len)
    }

    /// Decode raw network output into a probability in [0, 1]
    pub fn decode(&self, raw_output: f32) -> f32 {
        if raw_output.is_nan() || raw_output <= 0.0 {
            return 0.0;
        }
        if raw_output >= 1.0 {
            return 1.0;
        }

        let cp = if self.out_range == 0 || self.cd.is_empty() {
            if raw_output > self.min_out as f32 {
                1.0
            } else {
                0.0
            }
        } else {
            let ratio = (asigmoid(raw_output) - self.min_out as f32) / self.out_range as f32;
            let ratio = ratio.clamp(0.0, 1.0);
            let index = (ratio * (self.cd.len() - 1) as f32 + 0.5).floor() as usize;
            self.cd[index.min(self.cd.len() - 1)]
        };

        let center = self.options.center;
        let decoded = if cp < center {
            0.5 * cp / center
        } else {
            0.5 + 0.5 * (cp - center) / (1.0 - center)
        };

        decoded.clamp(0.0, 1.0)
    }

    pub fn min_out(&self) -> i64 {
        self.min_out
    }

    pub fn max_out(&self) -> i64 {
        self.max_out
    }

    pub fn out_range(&self) -> i64 {
        self.out_range
    }

    pub fn options(&self) -> &ThresholdOptions {
        &self.options
    }

    /// Cumulative probability table, non-decreasing
    pub fn table(&self) -> &[f32] {
        &self.cd
    }
}

/// Averaged mixture density sampled at `resolution * out_range` points
fn probability_density(mu_stds: &MuStd, options: &ThresholdOptions, support: &Support) -> Vec<f32> {
    let points = linspace(support.min_out as f32, support.max_out as f32, support.table_len);
    let divisor = (options.resolution * mu_stds.len()) as f32;

    let mut summed = vec![0f32; points.len()];
    for &(mu, std) in mu_stds.iter() {
        for (total, &x) in summed.iter_mut().zip(&points) {
            *total += pdf(x, mu, std);
        }
    }

    summed.iter_mut().for_each(|v| *v /= divisor);
    summed
}

/// Inverse sigmoid
fn asigmoid(x: f32) -> f32 {
    -(1.0 / x - 1.0).ln()
}

/// Normal probability density
fn pdf(x: f32, mu: f32, std: f32) -> f32 {
    if std == 0.0 {
        return 0.0;
    }
    let a = 1.0 / (std * (2.0 * PI).sqrt());
    a * (-(x - mu).powi(2) / (2.0 * std.powi(2))).exp()
}

/// Evenly spaced numbers over the closed interval `[start, stop]`
fn linspace(start: f32, stop: f32, num: usize) -> Vec<f32> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f32;
            let mut points: Vec<f32> = (0..num).map(|i| start + i as f32 * step).collect();
            points[num - 1] = stop;
            points
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn default_decoder() -> ThresholdDecoder {
        ThresholdDecoder::new(&MuStd::default(), ThresholdOptions::default()).unwrap()
    }

    #[test]
    fn test_bounds() {
        let decoder = default_decoder();
        assert_eq!(decoder.min_out(), -10);
        assert_eq!(decoder.max_out(), 22);
        assert_eq!(decoder.out_range(), 32);
        assert_eq!(decoder.table().len(), 200 * 32);
    }

    #[test]
    fn test_bounds_use_floor() {
        let decoder = ThresholdDecoder::new(&MuStd::new(vec![(0.5, 1.0)]), ThresholdOptions::default()).unwrap();
        // -3.5 floors to -4, 4.5 floors to 4
        assert_eq!(decoder.min_out(), -4);
        assert_eq!(decoder.max_out(), 4);
    }

    #[test]
    fn test_table_is_monotonic_and_normalized() {
        let decoder = default_decoder();
        let table = decoder.table();

        assert!(table.windows(2).all(|w| w[0] <= w[1]));
        assert_abs_diff_eq!(*table.last().unwrap(), 1.0, epsilon = 0.01);
    }

    #[test]
    fn test_boundary_passthrough() {
        for mu_std in [
            MuStd::default(),
            MuStd::new(vec![(1.0, 0.5), (8.0, 3.0)]),
            MuStd::new(vec![(2.0, 0.0)]),
        ] {
            let decoder = ThresholdDecoder::new(&mu_std, ThresholdOptions::default()).unwrap();
            assert_eq!(decoder.decode(0.0), 0.0);
            assert_eq!(decoder.decode(1.0), 1.0);
        }
    }

    #[test]
    fn test_output_within_unit_interval() {
        let decoder = default_decoder();
        for raw in [-5.0, -1e-6, 1e-9, 0.001, 0.3, 0.5, 0.9999, 1.0 + 1e-6, 42.0, f32::NAN] {
            let decoded = decoder.decode(raw);
            assert!((0.0..=1.0).contains(&decoded), "decode({}) = {}", raw, decoded);
        }
    }

    #[test]
    fn test_monotonic() {
        let decoder = ThresholdDecoder::new(
            &MuStd::new(vec![(6.0, 4.0), (1.0, 2.0)]),
            ThresholdOptions {
                center: 0.3,
                ..Default::default()
            },
        )
        .unwrap();

        let mut previous = 0.0;
        for i in 0..=10_000 {
            let raw = i as f32 / 10_000.0;
            let decoded = decoder.decode(raw);
            assert!(decoded >= previous, "decode({}) = {} < {}", raw, decoded, previous);
            previous = decoded;
        }
    }

    #[test]
    fn test_center_maps_to_half() {
        let decoder = default_decoder();
        // logit(sigmoid(6)) sits on the mean of the distribution
        let raw = 1.0 / (1.0 + (-6.0f32).exp());
        assert_abs_diff_eq!(decoder.decode(raw), 0.5, epsilon = 0.01);
    }

    #[test]
    fn test_high_confidence_region() {
        let decoder = ThresholdDecoder::new(
            &MuStd::default(),
            ThresholdOptions {
                center: 0.2,
                ..Default::default()
            },
        )
        .unwrap();
        let decoded = decoder.decode(0.9585);
        assert!(decoded > 0.5 && decoded < 1.0, "decoded = {}", decoded);
        assert_eq!(decoded, decoder.decode(0.9585));

        // Same raw score against the default center sits below the mean
        assert_abs_diff_eq!(default_decoder().decode(0.9585), 0.237, epsilon = 0.01);
    }

    #[test]
    fn test_degenerate_range() {
        let decoder = ThresholdDecoder::new(&MuStd::new(vec![(0.2, 0.0)]), ThresholdOptions::default()).unwrap();
        assert_eq!(decoder.out_range(), 0);
        assert!(decoder.table().is_empty());
        // Anything inside (0, 1) exceeds min_out = 0
        assert_eq!(decoder.decode(0.5), 1.0);
    }

    #[test]
    fn test_wide_distribution_rejected() {
        // Bounds beyond i32 used to overflow the range computation
        let result = ThresholdDecoder::new(&MuStd::new(vec![(0.0, 6e8)]), ThresholdOptions::default());
        assert!(matches!(result, Err(ThresholdError::TableTooLarge { .. })));

        // Fits in i64 but would need 16M table entries
        let result = ThresholdDecoder::new(&MuStd::new(vec![(0.0, 1e4)]), ThresholdOptions::default());
        assert!(matches!(result, Err(ThresholdError::TableTooLarge { len: 16_000_000 })));

        let result = ThresholdDecoder::new(&MuStd::new(vec![(0.0, f32::MAX)]), ThresholdOptions::default());
        assert!(matches!(result, Err(ThresholdError::Bounds(_))));
    }

    #[test]
    fn test_empty_distribution_rejected() {
        let result = ThresholdDecoder::new(&MuStd::new(Vec::new()), ThresholdOptions::default());
        assert!(matches!(result, Err(ThresholdError::Empty)));
    }

    #[test]
    fn test_table_len_matches_decoder() {
        let options = ThresholdOptions::default();
        assert_eq!(ThresholdDecoder::table_len(&MuStd::default(), &options).unwrap(), 6400);
        assert_eq!(default_decoder().table().len(), 6400);
    }

    #[test]
    fn test_linspace() {
        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(linspace(3.0, 9.0, 1), vec![3.0]);
        assert_eq!(linspace(0.0, 1.0, 5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
    }
}
