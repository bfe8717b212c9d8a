//! Reverb effect — Freeverb-style algorithmic reverb on the send bus.
//!
//! Parallel comb filters followed by series allpass filters. The synth feeds
//! it the summed reverb sends and adds the wet output to the dry mix, so
//! `tick` returns the wet signal only, scaled by the effect level.

/// A comb filter delay line with feedback.
#[derive(Debug, Clone)]
struct CombFilter {
    buffer: Vec<f32>,
    index: usize,
    feedback: f32,
    damp1: f32,
    damp2: f32,
    filterstore: f32,
}

impl CombFilter {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            index: 0,
            feedback: 0.84,
            damp1: 0.2,
            damp2: 0.8,
            filterstore: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let output = self.buffer[self.index];

        // Lowpass in the feedback path (damping)
        self.filterstore = output * self.damp2 + self.filterstore * self.damp1;

        self.buffer[self.index] = input + self.filterstore * self.feedback;
        self.index = (self.index + 1) % self.buffer.len();

        output
    }

    fn set_damp(&mut self, damp: f32) {
        self.damp1 = damp;
        self.damp2 = 1.0 - damp;
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.filterstore = 0.0;
    }
}

/// An allpass filter delay line.
#[derive(Debug, Clone)]
struct AllpassFilter {
    buffer: Vec<f32>,
    index: usize,
    feedback: f32,
}

impl AllpassFilter {
    fn new(size: usize) -> Self {
        Self {
            buffer: vec![0.0; size.max(1)],
            index: 0,
            feedback: 0.5,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let bufout = self.buffer[self.index];
        let output = bufout - input;

        self.buffer[self.index] = input + bufout * self.feedback;
        self.index = (self.index + 1) % self.buffer.len();

        output
    }

    fn clear(&mut self) {
        self.buffer.fill(0.0);
    }
}

// Tuning constants (scaled for 44100 Hz sample rate)
const COMB_TUNING: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];
const ALLPASS_TUNING: [usize; 4] = [556, 441, 341, 225];
const STEREO_SPREAD: usize = 23;

/// Reverb settings as configured (percent 0..100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReverbSettings {
    pub level: i32,
    pub size: i32,
    pub width: i32,
    pub damping: i32,
}

/// A stereo algorithmic reverb using the Freeverb design.
#[derive(Debug, Clone)]
pub struct Reverb {
    comb_l: Vec<CombFilter>,
    comb_r: Vec<CombFilter>,
    allpass_l: Vec<AllpassFilter>,
    allpass_r: Vec<AllpassFilter>,

    settings: ReverbSettings,
    /// Wet output level [0, 1].
    level: f32,
    wet1: f32,
    wet2: f32,
    gain: f32,
}

impl Reverb {
    /// Create a silent reverb for the given sample rate.
    pub fn new(sample_rate: f64) -> Self {
        let scale = sample_rate / 44100.0;
        let sized = |t: usize, spread: usize| ((t as f64) * scale) as usize + spread;

        let mut reverb = Self {
            comb_l: COMB_TUNING.iter().map(|&t| CombFilter::new(sized(t, 0))).collect(),
            comb_r: COMB_TUNING
                .iter()
                .map(|&t| CombFilter::new(sized(t, STEREO_SPREAD)))
                .collect(),
            allpass_l: ALLPASS_TUNING.iter().map(|&t| AllpassFilter::new(sized(t, 0))).collect(),
            allpass_r: ALLPASS_TUNING
                .iter()
                .map(|&t| AllpassFilter::new(sized(t, STEREO_SPREAD)))
                .collect(),
            settings: ReverbSettings::default(),
            level: 0.0,
            wet1: 1.0,
            wet2: 0.0,
            gain: 0.015,
        };
        reverb.apply(ReverbSettings::default());
        reverb
    }

    /// Rebuild for a new sample rate, keeping the current settings.
    pub fn resampled(&self, sample_rate: f64) -> Self {
        let mut reverb = Self::new(sample_rate);
        reverb.apply(self.settings);
        reverb
    }

    pub fn settings(&self) -> ReverbSettings {
        self.settings
    }

    /// Apply level / room size / width / damping (all percent).
    pub fn apply(&mut self, settings: ReverbSettings) {
        let pct = |v: i32| v.clamp(0, 100) as f32 * 0.01;
        self.settings = settings;
        self.level = pct(settings.level);

        let room_scale = 0.28;
        let room_offset = 0.7;
        let feedback = pct(settings.size) * room_scale + room_offset;
        let damp = pct(settings.damping) * 0.4;
        for comb in self.comb_l.iter_mut().chain(self.comb_r.iter_mut()) {
            comb.feedback = feedback;
            comb.set_damp(damp);
        }

        let width = pct(settings.width);
        self.wet1 = width / 2.0 + 0.5;
        self.wet2 = (1.0 - width) / 2.0;
    }

    /// Process one frame of reverb send, returning the wet stereo output.
    #[inline]
    pub fn tick(&mut self, send_l: f32, send_r: f32) -> (f32, f32) {
        let input = (send_l + send_r) * self.gain;

        let mut out_l = 0.0f32;
        let mut out_r = 0.0f32;
        for comb in &mut self.comb_l {
            out_l += comb.process(input);
        }
        for comb in &mut self.comb_r {
            out_r += comb.process(input);
        }
        for allpass in &mut self.allpass_l {
            out_l = allpass.process(out_l);
        }
        for allpass in &mut self.allpass_r {
            out_r = allpass.process(out_r);
        }

        let wet_l = out_l * self.wet1 + out_r * self.wet2;
        let wet_r = out_r * self.wet1 + out_l * self.wet2;
        (wet_l * self.level, wet_r * self.level)
    }

    /// Run the sends through the reverb and add the wet signal to the mix.
    pub fn process_sends(&mut self, sends_l: &[f32], sends_r: &[f32], left: &mut [f32], right: &mut [f32]) {
        let n = sends_l.len().min(sends_r.len()).min(left.len()).min(right.len());
        for i in 0..n {
            let (wet_l, wet_r) = self.tick(sends_l[i], sends_r[i]);
            left[i] += wet_l;
            right[i] += wet_r;
        }
    }

    /// Clear all internal buffers.
    pub fn clear(&mut self) {
        for comb in self.comb_l.iter_mut().chain(self.comb_r.iter_mut()) {
            comb.clear();
        }
        for allpass in self.allpass_l.iter_mut().chain(self.allpass_r.iter_mut()) {
            allpass.clear();
        }
    }
}
