//! DAHDSR envelope generator for sample voices.
//!
//! The volume envelope decays and releases exponentially (linear in dB, 100 dB
//! per stage time); the modulation envelope is linear throughout.

/// Level below which a releasing volume envelope is considered silent (-100 dB).
const SILENCE: f64 = 1e-5;

/// Release time used when a voice is choked.
pub const CHOKE_RELEASE_SECS: f64 = 0.005;

/// Envelope stages.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Idle,
    Delay,
    Attack,
    Hold,
    Decay,
    Sustain,
    Release,
}

/// Which curve family the envelope follows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnvelopeKind {
    Volume,
    Modulation,
}

/// Stage timings, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeParams {
    pub delay: f64,
    pub attack: f64,
    pub hold: f64,
    pub decay: f64,
    /// Volume: attenuation in dB. Modulation: level [0, 1].
    pub sustain: f64,
    pub release: f64,
}

impl Default for EnvelopeParams {
    fn default() -> Self {
        EnvelopeParams {
            delay: 0.0,
            attack: 0.0,
            hold: 0.0,
            decay: 0.0,
            sustain: 0.0,
            release: 0.0,
        }
    }
}

/// DAHDSR envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    kind: EnvelopeKind,
    params: EnvelopeParams,

    stage: Stage,
    level: f64,
    sample_rate: f64,
    /// Samples in current stage.
    stage_samples: usize,
    stage_counter: usize,
    /// Per-sample multiplier (volume decay/release) or step (modulation).
    slope: f64,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, sample_rate: f64) -> Self {
        Envelope {
            kind,
            params: EnvelopeParams::default(),
            stage: Stage::Idle,
            level: 0.0,
            sample_rate,
            stage_samples: 0,
            stage_counter: 0,
            slope: 0.0,
        }
    }

    /// Update the timings. Takes effect from the next stage transition,
    /// except for the sustain level which applies immediately.
    pub fn set_params(&mut self, params: EnvelopeParams) {
        self.params = params;
    }

    /// Trigger the envelope (note on).
    pub fn gate_on(&mut self) {
        self.level = 0.0;
        self.enter(Stage::Delay);
    }

    /// Release the envelope (note off).
    pub fn gate_off(&mut self) {
        if matches!(self.stage, Stage::Idle | Stage::Release) {
            return;
        }
        self.start_release(self.params.release);
    }

    /// Release quickly regardless of the programmed release time.
    pub fn choke(&mut self) {
        if self.stage == Stage::Idle {
            return;
        }
        self.start_release(CHOKE_RELEASE_SECS.min(self.params.release.max(0.0)));
    }

    /// Generate the next envelope sample [0, 1].
    pub fn next_sample(&mut self) -> f64 {
        match self.stage {
            Stage::Idle => {
                self.level = 0.0;
            }
            Stage::Delay => {
                if self.tick() {
                    self.enter(Stage::Attack);
                }
            }
            Stage::Attack => {
                if self.stage_samples == 0 {
                    self.level = 1.0;
                    self.enter(Stage::Hold);
                } else {
                    self.level = self.stage_counter as f64 / self.stage_samples as f64;
                    if self.tick() {
                        self.level = 1.0;
                        self.enter(Stage::Hold);
                    }
                }
            }
            Stage::Hold => {
                self.level = 1.0;
                if self.tick() {
                    self.enter(Stage::Decay);
                }
            }
            Stage::Decay => {
                let target = self.sustain_level();
                match self.kind {
                    EnvelopeKind::Volume => self.level *= self.slope,
                    EnvelopeKind::Modulation => self.level -= self.slope,
                }
                if self.level <= target || self.stage_samples == 0 {
                    self.level = target;
                    self.stage = Stage::Sustain;
                }
            }
            Stage::Sustain => {
                self.level = self.sustain_level();
            }
            Stage::Release => {
                match self.kind {
                    EnvelopeKind::Volume => self.level *= self.slope,
                    EnvelopeKind::Modulation => self.level -= self.slope,
                }
                let floor = match self.kind {
                    EnvelopeKind::Volume => SILENCE,
                    EnvelopeKind::Modulation => 0.0,
                };
                if self.level <= floor || self.stage_samples == 0 {
                    self.level = 0.0;
                    self.stage = Stage::Idle;
                }
            }
        }
        self.level
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    /// Returns true once the release stage has run out (or before gate on).
    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Idle
    }

    pub fn is_releasing(&self) -> bool {
        self.stage == Stage::Release
    }

    fn sustain_level(&self) -> f64 {
        match self.kind {
            EnvelopeKind::Volume => 10f64.powf(-self.params.sustain.max(0.0) / 20.0),
            EnvelopeKind::Modulation => self.params.sustain.clamp(0.0, 1.0),
        }
    }

    /// Advance the stage counter; true when the stage is over.
    fn tick(&mut self) -> bool {
        self.stage_counter += 1;
        self.stage_counter >= self.stage_samples
    }

    fn samples(&self, seconds: f64) -> usize {
        (seconds.max(0.0) * self.sample_rate) as usize
    }

    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        self.stage_counter = 0;
        self.stage_samples = match stage {
            Stage::Delay => self.samples(self.params.delay),
            Stage::Attack => self.samples(self.params.attack),
            Stage::Hold => self.samples(self.params.hold),
            Stage::Decay => self.samples(self.params.decay),
            _ => 0,
        };
        if stage == Stage::Decay {
            let n = self.stage_samples.max(1) as f64;
            self.slope = match self.kind {
                // Stage time covers a full 100 dB fall.
                EnvelopeKind::Volume => 10f64.powf(-5.0 / n),
                EnvelopeKind::Modulation => 1.0 / n,
            };
        }
        // Zero-length timed stages fall through on the next sample.
        if matches!(stage, Stage::Delay | Stage::Hold) && self.stage_samples == 0 {
            self.stage_samples = 1;
        }
    }

    fn start_release(&mut self, seconds: f64) {
        self.stage = Stage::Release;
        self.stage_counter = 0;
        self.stage_samples = self.samples(seconds);
        let n = self.stage_samples.max(1) as f64;
        self.slope = match self.kind {
            EnvelopeKind::Volume => 10f64.powf(-5.0 / n),
            EnvelopeKind::Modulation => 1.0 / n,
        };
    }
}
