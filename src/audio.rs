/// Audio buffer module for accumulating incoming PCM
///
/// Holds the samples that have not yet been consumed by feature extraction.
/// Samples are appended at the back and dropped from the front once a run of
/// feature rows has been extracted, so the buffer never grows past one
/// analysis window plus the last appended chunk.

use tracing::trace;

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Default sample rate expected by the models
pub const SAMPLE_RATE: usize = 16000;

/// Scale from 16-bit integer range to [-1, 1]
pub const SAMPLE_SCALE: f32 = 1.0 / 32768.0;

/// Decode little-endian 16-bit PCM bytes into samples
///
/// A trailing odd byte does not form a sample and is dropped.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<AudioSample> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Normalize samples to floating-point amplitude
pub fn samples_to_f32(samples: &[AudioSample]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 * SAMPLE_SCALE).collect()
}

/// Growable buffer of not-yet-consumed audio
#[derive(Debug, Default, Clone)]
pub struct AudioBuffer {
    samples: Vec<AudioSample>,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer with room for `capacity` samples before reallocating
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    /// Append samples at the back
    pub fn write(&mut self, samples: &[AudioSample]) {
        self.samples.extend_from_slice(samples);
        trace!("Appended {} samples, {} buffered", samples.len(), self.samples.len());
    }

    /// Drop `count` samples from the front (all of them if fewer are buffered)
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.samples.len());
        self.samples.drain(..count);
    }

    /// Buffered samples, oldest first
    pub fn as_slice(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bytes_to_samples() {
        assert_eq!(bytes_to_samples(&[0x01, 0x00, 0xFF, 0x7F]), vec![1, 32767]);
        assert_eq!(bytes_to_samples(&[0x00, 0x80]), vec![i16::MIN]);
        assert_eq!(bytes_to_samples(&[0xFF, 0xFF]), vec![-1]);
    }

    #[test]
    fn test_odd_trailing_byte_dropped() {
        assert_eq!(bytes_to_samples(&[0x01, 0x00, 0xFF, 0x7F, 0x42]), vec![1, 32767]);
        assert!(bytes_to_samples(&[0x42]).is_empty());
        assert!(bytes_to_samples(&[]).is_empty());
    }

    #[test]
    fn test_samples_to_f32() {
        let normalized = samples_to_f32(&[0, 16384, i16::MIN, i16::MAX]);
        assert_relative_eq!(normalized[0], 0.0);
        assert_relative_eq!(normalized[1], 0.5);
        assert_relative_eq!(normalized[2], -1.0);
        assert!(normalized[3] < 1.0);
    }

    #[test]
    fn test_write_and_consume() {
        let mut buffer = AudioBuffer::with_capacity(16);
        buffer.write(&[1, 2, 3, 4, 5]);
        assert_eq!(buffer.len(), 5);

        buffer.consume(2);
        assert_eq!(buffer.as_slice(), &[3, 4, 5]);

        buffer.write(&[6]);
        assert_eq!(buffer.as_slice(), &[3, 4, 5, 6]);
    }

    #[test]
    fn test_consume_more_than_buffered() {
        let mut buffer = AudioBuffer::new();
        buffer.write(&[1, 2, 3]);
        buffer.consume(10);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut buffer = AudioBuffer::new();
        buffer.write(&vec![1; 500]);
        buffer.clear();
        assert_eq!(buffer.len(), 0);
    }
}
