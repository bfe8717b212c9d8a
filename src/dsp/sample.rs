//! Raw sample data shared between voices.

use std::sync::Arc;

/// Shared, immutable PCM of one sample (mono, normalized f32).
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    data: Arc<[f32]>,
    /// Native sample rate of the audio.
    pub sample_rate: u32,
}

impl SampleBuffer {
    pub fn new(data: Arc<[f32]>, sample_rate: u32) -> Self {
        SampleBuffer {
            data,
            sample_rate: sample_rate.max(1),
        }
    }

    /// Read a sample with linear interpolation at a fractional position.
    pub fn read_interpolated(&self, position: f64) -> f64 {
        if self.data.is_empty() || position < 0.0 {
            return 0.0;
        }

        let idx = position as usize;
        if idx >= self.data.len() - 1 {
            return if idx < self.data.len() { self.data[idx] as f64 } else { 0.0 };
        }

        let frac = position - idx as f64;
        self.data[idx] as f64 * (1.0 - frac) + self.data[idx + 1] as f64 * frac
    }

    /// Like [`read_interpolated`](Self::read_interpolated), but the point
    /// after `loop_end - 1` is taken from `loop_start` so the loop seam is
    /// interpolated continuously.
    pub fn read_looped(&self, position: f64, loop_start: usize, loop_end: usize) -> f64 {
        let idx = position as usize;
        if loop_end > self.data.len() || loop_start >= loop_end || idx + 1 != loop_end {
            return self.read_interpolated(position);
        }
        let frac = position - idx as f64;
        self.data[idx] as f64 * (1.0 - frac) + self.data[loop_start] as f64 * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(data: Vec<f32>) -> SampleBuffer {
        SampleBuffer::new(Arc::from(data), 44100)
    }

    #[test]
    fn interpolation() {
        let buf = buffer(vec![0.0, 1.0, 0.0, -1.0]);
        assert!((buf.read_interpolated(0.0) - 0.0).abs() < 0.001);
        assert!((buf.read_interpolated(0.5) - 0.5).abs() < 0.001);
        assert!((buf.read_interpolated(1.0) - 1.0).abs() < 0.001);
        assert!((buf.read_interpolated(1.5) - 0.5).abs() < 0.001);
        assert_eq!(buf.read_interpolated(10.0), 0.0);
    }

    #[test]
    fn loop_seam_wraps_to_loop_start() {
        let buf = buffer(vec![0.0, 1.0, 0.5, -1.0]);
        // Loop [1, 3): sample 2 is followed by sample 1.
        let v = buf.read_looped(2.5, 1, 3);
        assert!((v - 0.75).abs() < 1e-6, "got {v}");
        // Away from the seam it matches plain interpolation.
        assert_eq!(buf.read_looped(1.5, 1, 3), buf.read_interpolated(1.5));
    }
}
