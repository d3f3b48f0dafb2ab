/// Trigger detector module
///
/// Debounces the calibrated probability sequence into discrete activations.
/// A run of confident chunks longer than the trigger level fires once, after
/// which the detector sits in a cooldown that must drain through quiet chunks
/// before it can fire again.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

/// Reference chunk size, in bytes, that the cooldown length is scaled against
pub const COOLDOWN_CHUNK_SIZE: i64 = 2048;

/// Cooldown length, in chunks, at the reference chunk size
pub const COOLDOWN_CHUNKS: i64 = 8;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Invalid detector configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the trigger detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Sensitivity (0.0 - 1.0, higher = more sensitive, more false positives)
    pub sensitivity: f32,

    /// Consecutive confident chunks needed beyond which an activation fires
    pub trigger_level: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sensitivity: 0.5,
            trigger_level: 3,
        }
    }
}

impl DetectorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !(0.0..=1.0).contains(&self.sensitivity) {
            return Err(DetectorError::InvalidConfig(
                "Sensitivity must be between 0.0 and 1.0".to_string()
            ));
        }

        if self.trigger_level == 0 {
            return Err(DetectorError::InvalidConfig(
                "Trigger level must be greater than 0".to_string()
            ));
        }

        Ok(())
    }
}

/// Hysteresis filter over calibrated probabilities
#[derive(Debug, Clone)]
pub struct TriggerDetector {
    sensitivity: f32,
    trigger_level: i32,
    cooldown: i32,
    activation: i32,
}

impl TriggerDetector {
    /// Create a detector for audio fed in `chunk_size`-byte chunks
    pub fn new(chunk_size: usize, config: DetectorConfig) -> Self {
        let cooldown = cooldown_for(chunk_size);

        debug!(
            "Trigger detector: sensitivity={} trigger_level={} cooldown={}",
            config.sensitivity, config.trigger_level, cooldown
        );

        Self {
            sensitivity: config.sensitivity,
            trigger_level: config.trigger_level.min(i32::MAX as u32) as i32,
            cooldown,
            activation: 0,
        }
    }

    /// Feed the next probability; returns true on the chunk that activates
    pub fn update(&mut self, prob: f32) -> bool {
        let chunk_activated = prob > 1.0 - self.sensitivity;

        if chunk_activated || self.activation < 0 {
            self.activation += 1;

            let has_activated = self.activation > self.trigger_level;

            if has_activated || (chunk_activated && self.activation < 0) {
                self.activation = self.cooldown;
            }

            trace!("prob={:.3} activation={}", prob, self.activation);

            if has_activated {
                return true;
            }
        } else if self.activation > 0 {
            self.activation -= 1;
        }

        false
    }

    /// Current activation counter; negative while cooling down
    pub fn activation(&self) -> i32 {
        self.activation
    }

    /// Value the counter is reset to after an activation
    pub fn cooldown(&self) -> i32 {
        self.cooldown
    }

    pub fn reset(&mut self) {
        self.activation = 0;
    }
}

/// `floor(-(8 * 2048) / chunk_size)`
fn cooldown_for(chunk_size: usize) -> i32 {
    let chunk_size = chunk_size.max(1) as i64;
    (-(COOLDOWN_CHUNKS * COOLDOWN_CHUNK_SIZE)).div_euclid(chunk_size) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> TriggerDetector {
        TriggerDetector::new(2048, DetectorConfig::default())
    }

    #[test]
    fn test_cooldown_scaling() {
        assert_eq!(cooldown_for(2048), -8);
        assert_eq!(cooldown_for(1024), -16);
        assert_eq!(cooldown_for(3000), -6);
        assert_eq!(cooldown_for(0), -16384);
    }

    #[test]
    fn test_quiet_input_never_activates() {
        let mut detector = detector();
        for i in 0..10_000 {
            let prob = (i % 50) as f32 / 100.0; // always <= 0.5
            assert!(!detector.update(prob));
            assert!(detector.activation() <= 0);
        }
    }

    #[test]
    fn test_activates_once_after_trigger_level() {
        let mut detector = detector();

        for _ in 0..3 {
            assert!(!detector.update(0.9));
        }
        assert_eq!(detector.activation(), 3);

        assert!(detector.update(0.9));
        assert_eq!(detector.activation(), -8);
    }

    #[test]
    fn test_cooldown_blocks_then_rearms() {
        let mut detector = detector();
        for _ in 0..4 {
            detector.update(0.9);
        }
        assert!(detector.activation() < 0);

        // Confident chunks during cooldown extend it
        for _ in 0..20 {
            assert!(!detector.update(0.9));
            assert!(detector.activation() < 0);
        }

        // Quiet chunks drain it
        for _ in 0..8 {
            assert!(!detector.update(0.1));
        }
        assert_eq!(detector.activation(), 0);

        for _ in 0..3 {
            assert!(!detector.update(0.9));
        }
        assert!(detector.update(0.9));
    }

    #[test]
    fn test_decay_when_quiet() {
        let mut detector = detector();
        detector.update(0.9);
        detector.update(0.9);
        assert_eq!(detector.activation(), 2);

        detector.update(0.1);
        assert_eq!(detector.activation(), 1);
        detector.update(0.1);
        detector.update(0.1);
        assert_eq!(detector.activation(), 0);
    }

    #[test]
    fn test_sensitivity_threshold_is_strict() {
        let mut detector = TriggerDetector::new(
            2048,
            DetectorConfig {
                sensitivity: 0.25,
                trigger_level: 1,
            },
        );
        assert!(!detector.update(0.75));
        assert_eq!(detector.activation(), 0);
        assert!(!detector.update(0.76));
        assert!(detector.update(0.76));
    }

    #[test]
    fn test_config_validation() {
        let mut config = DetectorConfig::default();
        assert!(config.validate().is_ok());

        config.sensitivity = 1.5;
        assert!(config.validate().is_err());

        config.sensitivity = 0.5;
        config.trigger_level = 0;
        assert!(config.validate().is_err());
    }
}
