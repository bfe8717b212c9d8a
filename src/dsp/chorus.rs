//! Chorus effect — stereo modulated delay, baked into each voice.
//!
//! Each channel runs its own LFO-modulated delay line, a quarter period
//! apart. Voices take a copy of the chorus settings at creation time; later
//! configuration changes only affect new voices.

use std::f64::consts::TAU;

/// Longest delay the lines can hold, seconds.
const MAX_DELAY: f64 = 0.05;

/// Chorus settings as configured (integer 0..100 scales).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChorusSettings {
    pub level: i32,
    pub depth: i32,
    pub frequency: i32,
}

impl ChorusSettings {
    pub fn is_enabled(&self) -> bool {
        self.level > 0
    }
}

/// One channel: circular buffer plus LFO phase.
#[derive(Debug, Clone)]
struct ChorusLine {
    buffer: Vec<f32>,
    write_pos: usize,
    phase: f64,
}

impl ChorusLine {
    fn new(len: usize, phase: f64) -> Self {
        ChorusLine {
            buffer: vec![0.0; len.max(2)],
            write_pos: 0,
            phase,
        }
    }

    /// Store `input`, then read `delay` samples back with linear
    /// interpolation.
    fn tick(&mut self, input: f32, delay: f64) -> f32 {
        let len = self.buffer.len();
        self.buffer[self.write_pos] = input;

        let delay = delay.clamp(1.0, (len - 1) as f64);
        let whole = delay as usize;
        let frac = (delay - whole as f64) as f32;
        let newer = (self.write_pos + len - whole) % len;
        let older = (newer + len - 1) % len;
        let out = self.buffer[newer] + frac * (self.buffer[older] - self.buffer[newer]);

        self.write_pos = (self.write_pos + 1) % len;
        out
    }

    fn advance(&mut self, increment: f64) {
        self.phase = (self.phase + increment).fract();
    }
}

#[derive(Debug, Clone)]
pub struct Chorus {
    sample_rate: f64,
    left: ChorusLine,
    right: ChorusLine,

    /// LFO rate in Hz.
    pub rate: f64,
    /// Modulation depth in seconds.
    pub depth: f64,
    /// Base delay time in seconds.
    pub delay: f64,
    /// Dry/wet mix (0.0 = fully dry, 1.0 = fully wet).
    pub mix: f64,
}

impl Chorus {
    pub fn new(sample_rate: f64) -> Self {
        let len = (sample_rate * MAX_DELAY) as usize + 1;
        Chorus {
            sample_rate,
            left: ChorusLine::new(len, 0.0),
            right: ChorusLine::new(len, 0.25),
            rate: 1.5,
            depth: 0.002,
            delay: 0.015,
            mix: 0.5,
        }
    }

    pub fn with_params(sample_rate: f64, rate: f64, depth: f64, mix: f64) -> Self {
        Chorus {
            rate: rate.clamp(0.1, 10.0),
            depth: depth.clamp(0.0, 0.01),
            mix: mix.clamp(0.0, 1.0),
            ..Chorus::new(sample_rate)
        }
    }

    /// Build a voice chorus from the configured settings, or `None` when the
    /// chorus level is zero.
    pub fn from_settings(sample_rate: f64, settings: ChorusSettings) -> Option<Self> {
        if !settings.is_enabled() {
            return None;
        }
        let unit = |v: i32| v.clamp(0, 100) as f64 / 100.0;
        Some(Self::with_params(
            sample_rate,
            0.1 + unit(settings.frequency) * 6.6,
            unit(settings.depth) * 0.005,
            0.5 * unit(settings.level),
        ))
    }

    fn delay_samples(&self, phase: f64) -> f64 {
        (self.delay + self.depth * (TAU * phase).sin()) * self.sample_rate
    }

    /// Process a stereo sample pair.
    #[inline]
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let delay_l = self.delay_samples(self.left.phase);
        let delay_r = self.delay_samples(self.right.phase);
        let wet_l = self.left.tick(left, delay_l);
        let wet_r = self.right.tick(right, delay_r);

        let increment = self.rate / self.sample_rate;
        self.left.advance(increment);
        self.right.advance(increment);

        let mix = self.mix as f32;
        (left + (wet_l - left) * mix, right + (wet_r - right) * mix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_when_level_is_zero() {
        let settings = ChorusSettings {
            level: 0,
            depth: 50,
            frequency: 50,
        };
        assert!(Chorus::from_settings(44100.0, settings).is_none());
    }

    #[test]
    fn settings_map_to_bounded_params() {
        let settings = ChorusSettings {
            level: 100,
            depth: 100,
            frequency: 100,
        };
        let chorus = Chorus::from_settings(44100.0, settings).expect("chorus enabled");
        assert!((chorus.mix - 0.5).abs() < 1e-9);
        assert!(chorus.depth <= 0.01);
        assert!(chorus.rate <= 10.0);
    }

    #[test]
    fn dry_mix_passes_input_through() {
        let mut chorus = Chorus::with_params(44100.0, 1.5, 0.002, 0.0);
        let (out_l, out_r) = chorus.process(0.5, -0.5);
        assert!((out_l - 0.5).abs() < 1e-6);
        assert!((out_r + 0.5).abs() < 1e-6);
    }

    #[test]
    fn wet_signal_is_delayed() {
        let mut chorus = Chorus::with_params(1000.0, 0.1, 0.0, 1.0);
        // 15 ms base delay at 1 kHz: the impulse comes back after 15 samples.
        let mut outputs = vec![chorus.process(1.0, 1.0).0];
        for _ in 0..30 {
            outputs.push(chorus.process(0.0, 0.0).0);
        }
        let peak = outputs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i);
        assert_eq!(peak, Some(15));
    }

    #[test]
    fn channels_are_modulated_out_of_phase() {
        let mut chorus = Chorus::new(44100.0);
        chorus.mix = 1.0;
        let differs = (0..4410).any(|i| {
            let input = (i as f32 * 0.05).sin();
            let (l, r) = chorus.process(input, input);
            (l - r).abs() > 0.001
        });
        assert!(differs, "left and right LFOs start a quarter period apart");
    }
}
