//! Clip limiter — keeps the master mix inside [-1, 1].
//!
//! Instant attack: when a frame would clip, the gain drops so that it
//! doesn't. The gain then recovers towards unity over the release time.

#[derive(Debug, Clone)]
pub struct ClipLimiter {
    sample_rate: f64,
    /// Time to recover from full reduction to unity, seconds.
    pub release: f64,
    gain: f64,
}

impl ClipLimiter {
    pub fn new(sample_rate: f64) -> Self {
        ClipLimiter {
            sample_rate,
            release: 0.2,
            gain: 1.0,
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
    }

    /// Current gain coefficient.
    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        let step = 1.0 / (self.release * self.sample_rate).max(1.0);
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let peak = l.abs().max(r.abs()) as f64;
            if peak * self.gain > 1.0 {
                self.gain = 1.0 / peak;
            }
            *l = ((*l as f64 * self.gain) as f32).clamp(-1.0, 1.0);
            *r = ((*r as f64 * self.gain) as f32).clamp(-1.0, 1.0);
            if self.gain < 1.0 {
                self.gain = (self.gain + step).min(1.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_signal_is_untouched() {
        let mut limiter = ClipLimiter::new(44100.0);
        let mut l = vec![0.5f32, -0.25, 0.9];
        let mut r = vec![-0.5f32, 0.25, -0.9];
        limiter.process(&mut l, &mut r);
        assert_eq!(l, vec![0.5, -0.25, 0.9]);
        assert_eq!(r, vec![-0.5, 0.25, -0.9]);
        assert_eq!(limiter.gain(), 1.0);
    }

    #[test]
    fn loud_signal_stays_in_bounds() {
        let mut limiter = ClipLimiter::new(44100.0);
        let mut l: Vec<f32> = (0..1024).map(|i| (i as f32 * 0.1).sin() * 4.0).collect();
        let mut r: Vec<f32> = l.iter().map(|s| -s).collect();
        limiter.process(&mut l, &mut r);
        assert!(l.iter().chain(&r).all(|s| (-1.0..=1.0).contains(s)));
        assert!(limiter.gain() < 1.0);
    }

    #[test]
    fn gain_recovers_after_release() {
        let mut limiter = ClipLimiter::new(1000.0);
        let mut l = vec![2.0f32];
        let mut r = vec![0.0f32];
        limiter.process(&mut l, &mut r);
        assert!((l[0] - 1.0).abs() < 1e-6);

        let mut l = vec![0.0f32; 400];
        let mut r = vec![0.0f32; 400];
        limiter.process(&mut l, &mut r);
        assert_eq!(limiter.gain(), 1.0);
    }
}
