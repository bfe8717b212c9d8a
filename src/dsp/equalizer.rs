//! Ten-band preview equalizer applied to the dry master mix.

use crate::dsp::filter::BiquadFilter;

/// Band centers in Hz.
pub const EQ_BANDS: [f64; 10] = [32.0, 64.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0];

/// Gain limit of each band, dB.
pub const EQ_RANGE_DB: f64 = 15.0;

const BAND_Q: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Equalizer {
    sample_rate: f64,
    active: bool,
    gains: [f64; 10],
    left: Vec<BiquadFilter>,
    right: Vec<BiquadFilter>,
}

impl Equalizer {
    pub fn new(sample_rate: f64) -> Self {
        Equalizer {
            sample_rate,
            active: false,
            gains: [0.0; 10],
            left: bands(sample_rate),
            right: bands(sample_rate),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Turn the EQ on or off. Filter state starts fresh when switched on.
    pub fn set_active(&mut self, active: bool) {
        if active && !self.active {
            for filter in self.left.iter_mut().chain(self.right.iter_mut()) {
                filter.reset();
            }
        }
        self.active = active;
    }

    pub fn gains(&self) -> [f64; 10] {
        self.gains
    }

    /// Set the ten band gains in dB, clamped to ±15.
    pub fn set_values(&mut self, gains: &[f64; 10]) {
        for (i, gain) in gains.iter().enumerate() {
            let gain = gain.clamp(-EQ_RANGE_DB, EQ_RANGE_DB);
            self.gains[i] = gain;
            self.left[i].set_gain_db(gain);
            self.right[i].set_gain_db(gain);
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        if sample_rate == self.sample_rate {
            return;
        }
        let gains = self.gains;
        *self = Equalizer {
            active: self.active,
            ..Equalizer::new(sample_rate)
        };
        self.set_values(&gains);
    }

    /// Filter both channels in place. Does nothing while inactive.
    pub fn filter_data(&mut self, left: &mut [f32], right: &mut [f32]) {
        if !self.active {
            return;
        }
        for (filters, data) in [(&mut self.left, left), (&mut self.right, right)] {
            for filter in filters.iter_mut().filter(|f| !f.is_transparent()) {
                for sample in data.iter_mut() {
                    *sample = filter.process(*sample as f64) as f32;
                }
            }
        }
    }
}

fn bands(sample_rate: f64) -> Vec<BiquadFilter> {
    EQ_BANDS
        .iter()
        .map(|&f| BiquadFilter::peaking(sample_rate, f, BAND_Q))
        .collect()
}
