//! Voice — one playing sample instance.
//!
//! A voice reads its sample with fractional, loop-aware position advance,
//! shapes it with envelopes, LFOs and a low-pass filter, then pans it into
//! the engine's dry and reverb-send buffers. Parameters are re-resolved at
//! every control tick (once per render call).

use std::f64::consts::FRAC_PI_2;

use crate::controls::ControlSnapshot;
use crate::dsp::chorus::Chorus;
use crate::dsp::envelope::{Envelope, EnvelopeKind, EnvelopeParams};
use crate::dsp::filter::{BiquadFilter, FilterType};
use crate::dsp::oscillator::Lfo;
use crate::dsp::sample::SampleBuffer;
use crate::dsp::voice_param::VoiceParam;
use crate::store::AttributeType as A;

/// Filter cutoffs at or above this are treated as fully open.
const OPEN_FILTER_HZ: f64 = 19_000.0;

/// Playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    /// Created, not rendered yet.
    Starting,
    Playing,
    Releasing,
    Finished,
}

/// Sample loop modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    None,
    Continuous,
    UntilRelease,
}

impl LoopMode {
    pub fn from_generator(value: i32) -> LoopMode {
        match value {
            1 => LoopMode::Continuous,
            3 => LoopMode::UntilRelease,
            _ => LoopMode::None,
        }
    }
}

/// Destination buffers of one render call.
pub struct VoiceOutput<'a> {
    pub left: &'a mut [f32],
    pub right: &'a mut [f32],
    pub reverb_left: &'a mut [f32],
    pub reverb_right: &'a mut [f32],
}

impl VoiceOutput<'_> {
    pub fn frames(&self) -> usize {
        self.left
            .len()
            .min(self.right.len())
            .min(self.reverb_left.len())
            .min(self.reverb_right.len())
    }
}

/// Values derived from the parameters once per tick.
struct TickValues {
    step: f64,
    gain: f64,
    pan_left: f64,
    pan_right: f64,
    reverb_send: f64,
    looping: bool,
    loop_start: usize,
    loop_end: usize,
    end: f64,
    mod_lfo_to_pitch: f64,
    vib_lfo_to_pitch: f64,
    mod_env_to_pitch: f64,
    mod_lfo_to_volume: f64,
    filter_active: bool,
}

#[derive(Debug, Clone)]
pub struct Voice {
    token: i32,
    param: VoiceParam,
    sample: SampleBuffer,
    output_rate: f64,

    state: VoiceState,
    position: f64,
    volume_env: Envelope,
    modulation_env: Envelope,
    mod_lfo: Lfo,
    vib_lfo: Lfo,
    filter: BiquadFilter,
    chorus: Option<Chorus>,

    exclusive_class: i32,
    release_generation: u64,
    stop_generation: u64,
}

impl Voice {
    /// `generations` are the release-by-key and stop-all counters at
    /// creation time; later changes to them release this voice.
    pub fn new(
        token: i32,
        param: VoiceParam,
        sample: SampleBuffer,
        output_rate: u32,
        chorus: Option<Chorus>,
        generations: (u64, u64),
    ) -> Self {
        let rate = output_rate.max(1) as f64;
        let exclusive_class = if param.key() >= 0 {
            param.get_integer(A::ExclusiveClass)
        } else {
            0
        };
        Voice {
            token,
            position: param.get_position(A::StartAddrsOffset) as f64,
            param,
            sample,
            output_rate: rate,
            state: VoiceState::Starting,
            volume_env: Envelope::new(EnvelopeKind::Volume, rate),
            modulation_env: Envelope::new(EnvelopeKind::Modulation, rate),
            mod_lfo: Lfo::new(rate),
            vib_lfo: Lfo::new(rate),
            filter: BiquadFilter::new(FilterType::Lowpass, rate),
            chorus,
            exclusive_class,
            release_generation: generations.0,
            stop_generation: generations.1,
        }
    }

    pub fn token(&self) -> i32 {
        self.token
    }

    pub fn key(&self) -> i32 {
        self.param.key()
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn exclusive_class(&self) -> i32 {
        self.exclusive_class
    }

    pub fn sf2_id(&self) -> i32 {
        self.param.sf2_id()
    }

    pub fn preset_id(&self) -> i32 {
        self.param.preset_id()
    }

    pub fn channel(&self) -> i32 {
        self.param.channel()
    }

    pub fn velocity(&self) -> i32 {
        self.param.velocity()
    }

    /// Current playback position in sample frames.
    pub fn position(&self) -> u32 {
        self.position.max(0.0) as u32
    }

    pub fn is_finished(&self) -> bool {
        self.state == VoiceState::Finished
    }

    /// Key-off: run the release segment.
    pub fn release(&mut self) {
        if matches!(self.state, VoiceState::Starting | VoiceState::Playing) {
            self.state = VoiceState::Releasing;
            self.volume_env.gate_off();
            self.modulation_env.gate_off();
        }
    }

    /// Release with a very short envelope (exclusive class, stop).
    pub fn choke(&mut self) {
        if self.state != VoiceState::Finished {
            self.state = VoiceState::Releasing;
            self.volume_env.choke();
            self.modulation_env.choke();
        }
    }

    fn envelope_params(&self) -> (EnvelopeParams, EnvelopeParams) {
        let p = &self.param;
        let volume = EnvelopeParams {
            delay: p.get_double(A::DelayVolEnv),
            attack: p.get_double(A::AttackVolEnv),
            hold: p.get_double(A::HoldVolEnv),
            decay: p.get_double(A::DecayVolEnv),
            sustain: p.get_double(A::SustainVolEnv),
            release: p.get_double(A::ReleaseVolEnv),
        };
        let modulation = EnvelopeParams {
            delay: p.get_double(A::DelayModEnv),
            attack: p.get_double(A::AttackModEnv),
            hold: p.get_double(A::HoldModEnv),
            decay: p.get_double(A::DecayModEnv),
            sustain: p.get_double(A::SustainModEnv),
            release: p.get_double(A::ReleaseModEnv),
        };
        (volume, modulation)
    }

    fn tick_values(&mut self, controls: &ControlSnapshot) -> TickValues {
        let p = &self.param;
        let key = p.key();
        let preview = key < 0;
        let length = p.sample_length() as usize;

        // Loop points and mode
        let mut loop_start = p.get_position(A::StartLoopAddrsOffset) as usize;
        let mut loop_end = p.get_position(A::EndLoopAddrsOffset) as usize;
        let mut correction = p.sample_fine_tune();
        let mode = if preview {
            if let Some(v) = controls.preview.start_loop.for_key(key) {
                loop_start = (v as usize).min(length);
            }
            if let Some(v) = controls.preview.end_loop.for_key(key) {
                loop_end = (v as usize).min(length);
            }
            if let Some(v) = controls.preview.pitch_correction.for_key(key) {
                correction = v;
            }
            if controls.loop_enabled { LoopMode::Continuous } else { LoopMode::None }
        } else {
            LoopMode::from_generator(p.get_integer(A::SampleModes))
        };
        let end = p.get_position(A::EndAddrsOffset) as f64;
        let releasing = self.state == VoiceState::Releasing;
        let looping = match mode {
            LoopMode::Continuous => true,
            LoopMode::UntilRelease => !releasing,
            LoopMode::None => false,
        } && loop_end > loop_start + 1
            && loop_end <= length;

        // Pitch
        // Previews play the raw sample: no temperament, tuning fork or master gain.
        let mut cents = (p.key_for_computation() - p.root_key()) as f64 * p.get_double(A::ScaleTuning)
            + p.get_double(A::CoarseTune) * 100.0
            + p.get_double(A::FineTune)
            + correction as f64;
        let mut step = p.sample_rate() as f64 / self.output_rate;
        if !preview {
            cents += controls.temperament[p.key_for_computation().rem_euclid(12) as usize];
            step *= controls.tuning_fork / 440.0;
        }
        step *= 2f64.powf(cents / 1200.0);

        // Gain and pan
        let mut gain = 10f64.powf(-p.get_double(A::InitialAttenuation) / 20.0);
        let mut pan = p.get_double(A::Pan);
        if preview {
            gain *= controls.sample_gain;
            if !controls.stereo {
                pan = 0.0;
                if key == -2 {
                    gain = 0.0;
                }
            }
        } else {
            gain *= controls.gain;
        }
        let angle = (pan + 0.5) * FRAC_PI_2;

        // Filter, swept by the modulation envelope and LFO at tick start
        let q_db = p.get_double(A::InitialFilterQ);
        let sweep = self.mod_lfo.value() * p.get_double(A::ModLfoToFilterFc)
            + self.modulation_env.level() * p.get_double(A::ModEnvToFilterFc);
        let cutoff = p.get_double(A::InitialFilterFc) * 2f64.powf(sweep / 1200.0);
        let filter_active = cutoff < OPEN_FILTER_HZ || q_db > 0.0;
        if filter_active {
            self.filter.set_lowpass(cutoff, q_db);
        }

        TickValues {
            step,
            gain,
            pan_left: angle.cos(),
            pan_right: angle.sin(),
            reverb_send: p.get_double(A::ReverbEffectsSend),
            looping,
            loop_start,
            loop_end,
            end,
            mod_lfo_to_pitch: p.get_double(A::ModLfoToPitch),
            vib_lfo_to_pitch: p.get_double(A::VibLfoToPitch),
            mod_env_to_pitch: p.get_double(A::ModEnvToPitch),
            mod_lfo_to_volume: p.get_double(A::ModLfoToVolume),
            filter_active,
        }
    }

    /// Render one buffer into `out`, accumulating.
    pub fn render(&mut self, controls: &ControlSnapshot, out: &mut VoiceOutput<'_>) {
        if self.state == VoiceState::Finished {
            return;
        }

        self.param.compute_modulations(&controls.controllers);
        let (volume, modulation) = self.envelope_params();
        self.volume_env.set_params(volume);
        self.modulation_env.set_params(modulation);
        self.mod_lfo.set_frequency(self.param.get_double(A::FreqModLfo));
        self.vib_lfo.set_frequency(self.param.get_double(A::FreqVibLfo));
        if self.state == VoiceState::Starting {
            self.mod_lfo.set_delay(self.param.get_double(A::DelayModLfo));
            self.vib_lfo.set_delay(self.param.get_double(A::DelayVibLfo));
            self.volume_env.gate_on();
            self.modulation_env.gate_on();
        }

        if controls.stop_generation != self.stop_generation {
            self.stop_generation = controls.stop_generation;
            self.choke();
        }
        if controls.is_key_released(self.key(), self.release_generation) {
            self.release();
        }

        let t = self.tick_values(controls);
        let frames = out.frames();
        for i in 0..frames {
            let mod_lfo = self.mod_lfo.next_sample();
            let vib_lfo = self.vib_lfo.next_sample();
            let mod_env = self.modulation_env.next_sample();
            let vol_env = self.volume_env.next_sample();

            let pitch = mod_lfo * t.mod_lfo_to_pitch + vib_lfo * t.vib_lfo_to_pitch + mod_env * t.mod_env_to_pitch;
            let step = if pitch == 0.0 { t.step } else { t.step * 2f64.powf(pitch / 1200.0) };

            let raw = if t.looping {
                self.sample.read_looped(self.position, t.loop_start, t.loop_end)
            } else {
                self.sample.read_interpolated(self.position)
            };
            let filtered = if t.filter_active { self.filter.process(raw) } else { raw };
            let tremolo = if t.mod_lfo_to_volume == 0.0 {
                1.0
            } else {
                10f64.powf(mod_lfo * t.mod_lfo_to_volume / 20.0)
            };
            let amp = filtered * vol_env * t.gain * tremolo;

            let mut l = (amp * t.pan_left) as f32;
            let mut r = (amp * t.pan_right) as f32;
            if let Some(chorus) = &mut self.chorus {
                (l, r) = chorus.process(l, r);
            }
            out.left[i] += l;
            out.right[i] += r;
            out.reverb_left[i] += l * t.reverb_send as f32;
            out.reverb_right[i] += r * t.reverb_send as f32;

            self.position += step;
            if t.looping && self.position >= t.loop_end as f64 {
                let span = (t.loop_end - t.loop_start) as f64;
                while self.position >= t.loop_end as f64 {
                    self.position -= span;
                }
            } else if self.position >= t.end {
                self.state = VoiceState::Finished;
                break;
            }
            if self.volume_env.is_finished() {
                self.state = VoiceState::Finished;
                break;
            }
        }

        if self.state == VoiceState::Starting {
            self.state = VoiceState::Playing;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::EngineControls;
    use crate::dsp::voice_param::DivisionChain;
    use crate::store::{AttributeStore, MemoryStore};

    struct Buffers {
        left: Vec<f32>,
        right: Vec<f32>,
        rev_left: Vec<f32>,
        rev_right: Vec<f32>,
    }

    impl Buffers {
        fn new(frames: usize) -> Self {
            Buffers {
                left: vec![0.0; frames],
                right: vec![0.0; frames],
                rev_left: vec![0.0; frames],
                rev_right: vec![0.0; frames],
            }
        }

        fn output(&mut self) -> VoiceOutput<'_> {
            VoiceOutput {
                left: &mut self.left,
                right: &mut self.right,
                reverb_left: &mut self.rev_left,
                reverb_right: &mut self.rev_right,
            }
        }

        fn peak(&self) -> f32 {
            self.left.iter().chain(&self.right).fold(0.0f32, |m, s| m.max(s.abs()))
        }
    }

    fn sine(len: usize) -> Vec<f32> {
        (0..len).map(|i| (i as f32 * 0.1).sin() * 0.5).collect()
    }

    fn make_voice(store: &MemoryStore, key: i32, loop_mode: Option<u16>) -> Voice {
        let smpl = store.add_sample(0, 0, sine(1000), 44100, 60);
        store.set_value(smpl, A::SampleStartLoop, 200).unwrap();
        store.set_value(smpl, A::SampleEndLoop, 800).unwrap();
        let mut param = VoiceParam::new(store, &DivisionChain::sample_only(smpl), 0, key, 127, true);
        if let Some(mode) = loop_mode {
            param.set_loop_mode(mode);
        }
        let data = store.sample_data(smpl).unwrap();
        Voice::new(1, param, SampleBuffer::new(data, 44100), 44100, None, (0, 0))
    }

    #[test]
    fn unlooped_voice_finishes_at_sample_end() {
        let store = MemoryStore::new();
        let mut voice = make_voice(&store, 60, None);
        let snapshot = ControlSnapshot::default();
        let mut buffers = Buffers::new(512);
        voice.render(&snapshot, &mut buffers.output());
        assert_eq!(voice.state(), VoiceState::Playing);
        assert!(buffers.peak() > 0.01, "voice should be audible");
        voice.render(&snapshot, &mut buffers.output());
        assert!(voice.is_finished(), "1000 frames at unity step end within 1024");
    }

    #[test]
    fn looped_voice_keeps_playing_inside_loop() {
        let store = MemoryStore::new();
        let mut voice = make_voice(&store, 60, Some(1));
        let snapshot = ControlSnapshot::default();
        let mut buffers = Buffers::new(512);
        for _ in 0..20 {
            voice.render(&snapshot, &mut buffers.output());
            assert!(!voice.is_finished());
            assert!(voice.position() < 800);
        }
    }

    #[test]
    fn loop_until_release_runs_to_end_after_release() {
        let store = MemoryStore::new();
        let mut voice = make_voice(&store, 60, Some(3));
        let snapshot = ControlSnapshot::default();
        let mut buffers = Buffers::new(512);
        for _ in 0..4 {
            voice.render(&snapshot, &mut buffers.output());
        }
        assert!(!voice.is_finished());
        voice.release();
        assert_eq!(voice.state(), VoiceState::Releasing);
        for _ in 0..4 {
            voice.render(&snapshot, &mut buffers.output());
        }
        assert!(voice.is_finished());
    }

    #[test]
    fn pitch_follows_key_distance_to_root() {
        let store = MemoryStore::new();
        let mut voice = make_voice(&store, 72, Some(0));
        let snapshot = ControlSnapshot::default();
        let mut buffers = Buffers::new(100);
        voice.render(&snapshot, &mut buffers.output());
        assert_eq!(voice.position(), 200, "an octave up reads two frames per output frame");
    }

    #[test]
    fn tuning_fork_scales_step() {
        let store = MemoryStore::new();
        let mut voice = make_voice(&store, 60, Some(0));
        let mut snapshot = ControlSnapshot::default();
        snapshot.tuning_fork = 220.0;
        let mut buffers = Buffers::new(100);
        voice.render(&snapshot, &mut buffers.output());
        assert_eq!(voice.position(), 50);
    }

    #[test]
    fn preview_ignores_tuning_fork_and_master_gain() {
        let store = MemoryStore::new();
        let smpl = store.add_sample(0, 0, sine(1000), 44100, 60);
        let mut param = VoiceParam::new(&store, &DivisionChain::sample_only(smpl), 0, -1, 127, true);
        param.prepare_for_sample(-1, param.sample_link());
        let data = store.sample_data(smpl).unwrap();
        let mut voice = Voice::new(1, param, SampleBuffer::new(data, 44100), 44100, None, (0, 0));
        let mut snapshot = ControlSnapshot::default();
        snapshot.tuning_fork = 220.0;
        snapshot.gain = 0.0;
        let mut buffers = Buffers::new(100);
        voice.render(&snapshot, &mut buffers.output());
        assert_eq!(voice.position(), 100, "preview reads one frame per output frame");
        assert!(buffers.peak() > 0.01, "master gain does not mute the preview");
    }

    #[test]
    fn key_release_generation_triggers_release() {
        let store = MemoryStore::new();
        let controls = EngineControls::new();
        let mut voice = make_voice(&store, 60, Some(1));
        let mut snapshot = controls.snapshot();
        let mut buffers = Buffers::new(64);
        voice.render(&snapshot, &mut buffers.output());
        assert_eq!(voice.state(), VoiceState::Playing);

        controls.release_key(61);
        controls.refresh(&mut snapshot);
        voice.render(&snapshot, &mut buffers.output());
        assert_eq!(voice.state(), VoiceState::Playing, "other keys are ignored");

        controls.release_key(60);
        controls.refresh(&mut snapshot);
        voice.render(&snapshot, &mut buffers.output());
        assert!(matches!(voice.state(), VoiceState::Releasing | VoiceState::Finished));
    }

    #[test]
    fn stop_all_chokes_quickly() {
        let store = MemoryStore::new();
        let controls = EngineControls::new();
        let mut voice = make_voice(&store, 60, Some(1));
        let mut snapshot = controls.snapshot();
        let mut buffers = Buffers::new(256);
        voice.render(&snapshot, &mut buffers.output());
        controls.stop_all();
        controls.refresh(&mut snapshot);
        voice.render(&snapshot, &mut buffers.output());
        assert!(voice.is_finished(), "choke releases within one 256 frame buffer");
    }

    #[test]
    fn linked_preview_voice_is_silent_in_mono() {
        let store = MemoryStore::new();
        let mut voice = make_voice(&store, -2, None);
        let mut snapshot = ControlSnapshot::default();
        snapshot.stereo = false;
        let mut buffers = Buffers::new(256);
        voice.render(&snapshot, &mut buffers.output());
        assert_eq!(buffers.peak(), 0.0);
    }

    #[test]
    fn reverb_send_follows_generator() {
        let store = MemoryStore::new();
        let smpl = store.add_sample(0, 0, sine(1000), 44100, 60);
        let inst = store.add_instrument(0, 0);
        let div = store.link_sample(inst, smpl);
        store.set_value(div, A::ReverbEffectsSend, 500).unwrap();
        let chain = DivisionChain {
            preset_division: None,
            instrument_division: Some(div),
            sample: smpl,
        };
        let param = VoiceParam::new(&store, &chain, 0, 60, 127, true);
        let data = store.sample_data(smpl).unwrap();
        let mut voice = Voice::new(1, param, SampleBuffer::new(data, 44100), 44100, None, (0, 0));
        let mut buffers = Buffers::new(256);
        voice.render(&ControlSnapshot::default(), &mut buffers.output());
        for i in 0..256 {
            assert!((buffers.rev_left[i] - buffers.left[i] * 0.5).abs() < 1e-6);
        }
    }
}
