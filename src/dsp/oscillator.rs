//! Low-frequency and calibration oscillators.

use std::f64::consts::PI;

/// Triangle LFO with a start delay, as used by the modulation and vibrato
/// LFOs. Output starts at 0, rises to +1 at a quarter period, falls to -1
/// at three quarters.
#[derive(Debug, Clone)]
pub struct Lfo {
    sample_rate: f64,
    delay_samples: usize,
    elapsed: usize,
    phase: f64,
    frequency: f64,
    value: f64,
}

impl Lfo {
    pub fn new(sample_rate: f64) -> Self {
        Lfo {
            sample_rate,
            delay_samples: 0,
            elapsed: 0,
            phase: 0.0,
            frequency: 8.176,
            value: 0.0,
        }
    }

    /// Delay before the LFO starts moving.
    pub fn set_delay(&mut self, seconds: f64) {
        self.delay_samples = (seconds.max(0.0) * self.sample_rate) as usize;
    }

    /// Frequency in Hz.
    pub fn set_frequency(&mut self, hz: f64) {
        self.frequency = hz.clamp(0.0, self.sample_rate / 4.0);
    }

    /// Generate the next LFO value in [-1, 1].
    pub fn next_sample(&mut self) -> f64 {
        if self.elapsed < self.delay_samples {
            self.elapsed += 1;
            return 0.0;
        }
        self.value = triangle(self.phase);
        self.phase += self.frequency / self.sample_rate;
        if self.phase >= 1.0 {
            self.phase -= self.phase.floor();
        }
        self.value
    }

    /// Last generated value.
    pub fn value(&self) -> f64 {
        self.value
    }
}

fn triangle(phase: f64) -> f64 {
    if phase < 0.25 {
        4.0 * phase
    } else if phase < 0.75 {
        2.0 - 4.0 * phase
    } else {
        4.0 * phase - 4.0
    }
}

/// Recursive sine generator (Gordon-Smith / magic circle).
///
/// Changing the frequency interpolates the rotation coefficient across one
/// block so the tone glides without clicks.
#[derive(Debug, Clone)]
pub struct SineGenerator {
    sample_rate: f64,
    frequency: Option<f64>,
    epsilon: f64,
    sin: f64,
    cos: f64,
}

impl SineGenerator {
    pub fn new(sample_rate: f64) -> Self {
        SineGenerator {
            sample_rate,
            frequency: None,
            epsilon: 0.0,
            sin: 0.0,
            cos: 1.0,
        }
    }

    fn epsilon(&self, frequency: f64) -> (f64, f64) {
        let theta = 2.0 * PI * frequency / self.sample_rate;
        (theta, 2.0 * (theta / 2.0).sin())
    }

    /// Add `coef * sine` to `data`, gliding to `frequency` over the block.
    pub fn add_data(&mut self, data: &mut [f32], frequency: f64, coef: f64) {
        let previous = match self.frequency {
            Some(f) => f,
            None => {
                let (theta, epsilon) = self.epsilon(frequency);
                self.epsilon = epsilon;
                self.sin = (-theta).sin();
                self.cos = (-theta).cos();
                self.frequency = Some(frequency);
                frequency
            }
        };

        if previous != frequency && !data.is_empty() {
            let (_, target) = self.epsilon(frequency);
            let len = data.len() as f64;
            for (i, sample) in data.iter_mut().enumerate() {
                let t = i as f64 / len;
                let eps = (1.0 - t) * self.epsilon + t * target;
                self.cos -= eps * self.sin;
                self.sin += eps * self.cos;
                *sample += (coef * self.sin) as f32;
            }
            self.epsilon = target;
            self.frequency = Some(frequency);
        } else {
            for sample in data.iter_mut() {
                self.cos -= self.epsilon * self.sin;
                self.sin += self.epsilon * self.cos;
                *sample += (coef * self.sin) as f32;
            }
        }
    }
}

/// Calibration tone added to the master mix.
#[derive(Debug, Clone)]
pub struct CalibrationSinus {
    generator: SineGenerator,
    buffer: Vec<f32>,
    sample_rate: f64,
    frequency: f64,
    /// Current and target amplitude; the level ramps between them per block.
    level: f64,
    target: f64,
}

const CALIBRATION_LEVEL: f64 = 0.1;

impl CalibrationSinus {
    pub fn new(sample_rate: f64) -> Self {
        CalibrationSinus {
            generator: SineGenerator::new(sample_rate),
            buffer: Vec::new(),
            sample_rate,
            frequency: 440.0,
            level: 0.0,
            target: 0.0,
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        if sample_rate != self.sample_rate {
            *self = CalibrationSinus {
                target: self.target,
                frequency: self.frequency,
                ..CalibrationSinus::new(sample_rate)
            };
        }
    }

    /// Tune to an equal-tempered key (A4 = 69 = 440 Hz).
    pub fn set_pitch(&mut self, key: i32) {
        self.frequency = 440.0 * 2f64.powf((key - 69) as f64 / 12.0);
    }

    pub fn on(&mut self) {
        self.target = CALIBRATION_LEVEL;
    }

    pub fn off(&mut self) {
        self.target = 0.0;
    }

    pub fn is_sounding(&self) -> bool {
        self.level > 0.0 || self.target > 0.0
    }

    /// Add the tone to both channels.
    pub fn add_data(&mut self, left: &mut [f32], right: &mut [f32]) {
        if !self.is_sounding() {
            return;
        }
        let n = left.len().min(right.len());
        if self.buffer.len() < n {
            self.buffer.resize(n, 0.0);
        }
        let buffer = &mut self.buffer[..n];
        buffer.fill(0.0);
        self.generator.add_data(buffer, self.frequency, 1.0);

        let start = self.level;
        let step = (self.target - start) / n.max(1) as f64;
        for i in 0..n {
            let gain = (start + step * (i + 1) as f64) as f32;
            let v = buffer[i] * gain;
            left[i] += v;
            right[i] += v;
        }
        self.level = self.target;
    }
}
