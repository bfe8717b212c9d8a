//! Per-voice parameter resolution.
//!
//! A voice's parameters come from the sample record and up to four
//! divisions. Instrument level values are absolute (division over global
//! over default); preset level values are offsets added on top (division
//! over global). Modulators then add a per-tick modulation to each slot.

use crate::controls::ControllerValues;
use crate::dsp::modulator::{ModulationInputs, ParameterBank};
use crate::dsp::modulator_group::ModulatorGroup;
use crate::store::{AttributeStore, AttributeType, ElementId, SampleLink};

use AttributeType as A;

/// The element chain a voice is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DivisionChain {
    /// Preset division pointing at the instrument.
    pub preset_division: Option<ElementId>,
    /// Instrument division pointing at the sample.
    pub instrument_division: Option<ElementId>,
    pub sample: ElementId,
}

impl DivisionChain {
    pub fn sample_only(sample: ElementId) -> Self {
        DivisionChain {
            preset_division: None,
            instrument_division: None,
            sample,
        }
    }
}

/// Timecents to seconds.
pub fn timecents_to_secs(tc: f64) -> f64 {
    2f64.powf(tc.clamp(-12000.0, 8000.0) / 1200.0)
}

/// Absolute cents to Hz (8.176 Hz at 0).
pub fn abs_cents_to_hz(cents: f64) -> f64 {
    8.175_798_915_643_707 * 2f64.powf(cents / 1200.0)
}

#[derive(Debug, Clone)]
pub struct VoiceParam {
    channel: i32,
    key: i32,
    velocity: i32,
    sf2_id: i32,
    preset_id: i32,

    key_for_computation: i32,
    vel_for_computation: i32,

    parameters: ParameterBank,
    instrument_group: ModulatorGroup,
    preset_group: ModulatorGroup,

    sample_length: u32,
    sample_loop_start: u32,
    sample_loop_end: u32,
    sample_rate: u32,
    sample_root_key: i32,
    sample_fine_tune: i32,
    sample_link: SampleLink,
}

impl VoiceParam {
    pub fn new(
        store: &dyn AttributeStore,
        chain: &DivisionChain,
        channel: i32,
        key: i32,
        velocity: i32,
        vel_to_filter: bool,
    ) -> Self {
        let sample = chain.sample;
        let get = |attribute| store.get(sample, attribute).as_i32();
        let length = get(A::SampleLength).max(0) as u32;

        let mut param = VoiceParam {
            channel,
            key,
            velocity,
            sf2_id: sample.sf2,
            preset_id: chain.preset_division.map_or(-1, |d| d.element),
            key_for_computation: key,
            vel_for_computation: velocity,
            parameters: ParameterBank::default(),
            instrument_group: ModulatorGroup::new(false),
            preset_group: ModulatorGroup::new(true),
            sample_length: length,
            sample_loop_start: (get(A::SampleStartLoop).max(0) as u32).min(length),
            sample_loop_end: (get(A::SampleEndLoop).max(0) as u32).min(length),
            sample_rate: get(A::SampleRate).max(1) as u32,
            sample_root_key: get(A::SampleOriginalPitch),
            sample_fine_tune: get(A::SamplePitchCorrection),
            sample_link: store.get(sample, A::SampleType).as_link(),
        };

        param.read_instrument_attributes(store, chain.instrument_division);
        param.read_preset_attributes(store, chain.preset_division);

        param.instrument_group.load_default_modulators(vel_to_filter);
        if let Some(division) = chain.instrument_division {
            param.instrument_group.load_modulators(&store.modulators(division.parent()));
            param.instrument_group.load_modulators(&store.modulators(division));
        }
        if let Some(division) = chain.preset_division {
            param.preset_group.load_modulators(&store.modulators(division.parent()));
            param.preset_group.load_modulators(&store.modulators(division));
        }

        let keynum = param.parameters[A::Keynum].base() as i32;
        if keynum >= 0 {
            param.key_for_computation = keynum;
        }
        let forced_velocity = param.parameters[A::Velocity].base() as i32;
        if forced_velocity >= 0 {
            param.vel_for_computation = forced_velocity;
        }
        param
    }

    fn read_instrument_attributes(&mut self, store: &dyn AttributeStore, division: Option<ElementId>) {
        let Some(division) = division else {
            return;
        };
        let global = division.parent();
        for attribute in AttributeType::generators().filter(|a| !a.is_structural()) {
            let source = if store.is_set(division, attribute) {
                Some(division)
            } else if store.is_set(global, attribute) {
                Some(global)
            } else {
                None
            };
            if let Some(id) = source {
                self.parameters[attribute].set_base(store.get(id, attribute).as_i32() as f64);
            }
        }
    }

    fn read_preset_attributes(&mut self, store: &dyn AttributeStore, division: Option<ElementId>) {
        let Some(division) = division else {
            return;
        };
        let global = division.parent();
        for attribute in AttributeType::generators().filter(|a| !a.is_structural() && !a.is_instrument_only()) {
            let offset = if store.is_set(division, attribute) {
                store.get(division, attribute).as_i32()
            } else if store.is_set(global, attribute) {
                store.get(global, attribute).as_i32()
            } else {
                continue;
            };
            self.parameters[attribute].add_to_base(offset as f64);
        }
    }

    /// Set up a sample preview voice on key -1 or -2: full velocity at the
    /// root key, panned hard to its side if part of a stereo pair.
    pub fn prepare_for_sample(&mut self, key: i32, link: SampleLink) {
        self.key = key;
        self.key_for_computation = self.root_key();
        self.vel_for_computation = 127;
        self.velocity = 127;
        let pan = if link.is_left() {
            -500.0
        } else if link.is_right() {
            500.0
        } else {
            0.0
        };
        self.set_pan(pan);
    }

    /// Pan in 0.1 % units (-500 left .. 500 right).
    pub fn set_pan(&mut self, value: f64) {
        self.parameters[A::Pan].set_base(value);
    }

    pub fn set_loop_mode(&mut self, mode: u16) {
        self.parameters[A::SampleModes].set_base(mode as f64);
    }

    /// Re-evaluate both modulator groups, preset level first. Returns false
    /// if either graph did not settle.
    pub fn compute_modulations(&mut self, controllers: &ControllerValues) -> bool {
        self.parameters.clear_modulations();
        let inputs = ModulationInputs {
            key: self.key_for_computation,
            velocity: self.vel_for_computation,
            controllers,
        };
        let preset = self.preset_group.process(&mut self.parameters, &inputs);
        let instrument = self.instrument_group.process(&mut self.parameters, &inputs);
        preset.converged && instrument.converged
    }

    fn key_scaling(&self, attribute: AttributeType) -> f64 {
        self.parameters[attribute].modulated() * (60 - self.key_for_computation) as f64
    }

    /// Value after modulation, converted to a working unit: seconds for
    /// times, Hz for frequencies, dB for attenuations, fractions for sends,
    /// pan and modulation sustain. Everything else is returned raw.
    pub fn get_double(&self, attribute: AttributeType) -> f64 {
        let v = self.parameters[attribute].modulated();
        match attribute {
            A::DelayModLfo
            | A::DelayVibLfo
            | A::DelayModEnv
            | A::AttackModEnv
            | A::ReleaseModEnv
            | A::DelayVolEnv
            | A::AttackVolEnv
            | A::ReleaseVolEnv => timecents_to_secs(v),
            A::HoldModEnv => timecents_to_secs(v + self.key_scaling(A::KeynumToModEnvHold)),
            A::DecayModEnv => timecents_to_secs(v + self.key_scaling(A::KeynumToModEnvDecay)),
            A::HoldVolEnv => timecents_to_secs(v + self.key_scaling(A::KeynumToVolEnvHold)),
            A::DecayVolEnv => timecents_to_secs(v + self.key_scaling(A::KeynumToVolEnvDecay)),
            A::FreqModLfo | A::FreqVibLfo => abs_cents_to_hz(v.clamp(-16000.0, 4500.0)),
            A::InitialFilterFc => abs_cents_to_hz(v.clamp(1500.0, 13500.0)),
            A::InitialFilterQ => v.clamp(0.0, 960.0) / 10.0,
            A::InitialAttenuation | A::SustainVolEnv => v.clamp(0.0, 1440.0) / 10.0,
            A::SustainModEnv => 1.0 - v.clamp(0.0, 1000.0) / 1000.0,
            A::ChorusEffectsSend | A::ReverbEffectsSend => v.clamp(0.0, 1000.0) / 1000.0,
            A::Pan => v.clamp(-500.0, 500.0) / 1000.0,
            A::ModLfoToVolume => v.clamp(-960.0, 960.0) / 10.0,
            _ => v,
        }
    }

    pub fn get_integer(&self, attribute: AttributeType) -> i32 {
        self.parameters[attribute].modulated().round() as i32
    }

    /// Sample frame for a start/end/loop position, including fine and
    /// coarse offsets, clamped to the sample.
    pub fn get_position(&self, attribute: AttributeType) -> u32 {
        let (origin, coarse) = match attribute {
            A::StartAddrsOffset => (0, A::StartAddrsCoarseOffset),
            A::EndAddrsOffset => (self.sample_length as i64, A::EndAddrsCoarseOffset),
            A::StartLoopAddrsOffset => (self.sample_loop_start as i64, A::StartLoopAddrsCoarseOffset),
            A::EndLoopAddrsOffset => (self.sample_loop_end as i64, A::EndLoopAddrsCoarseOffset),
            _ => return self.get_integer(attribute).max(0) as u32,
        };
        let offset = self.get_integer(attribute) as i64 + 32768 * self.get_integer(coarse) as i64;
        (origin + offset).clamp(0, self.sample_length as i64) as u32
    }

    /// Root key: overriding root key if set, else the sample's.
    pub fn root_key(&self) -> i32 {
        let overriding = self.get_integer(A::OverridingRootKey);
        if overriding >= 0 { overriding } else { self.sample_root_key }
    }

    pub fn channel(&self) -> i32 {
        self.channel
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    pub fn velocity(&self) -> i32 {
        self.velocity
    }

    pub fn key_for_computation(&self) -> i32 {
        self.key_for_computation
    }

    pub fn sf2_id(&self) -> i32 {
        self.sf2_id
    }

    pub fn preset_id(&self) -> i32 {
        self.preset_id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sample_length(&self) -> u32 {
        self.sample_length
    }

    pub fn sample_fine_tune(&self) -> i32 {
        self.sample_fine_tune
    }

    pub fn sample_link(&self) -> SampleLink {
        self.sample_link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AttributeValue, CurveType, MemoryStore, ModulatorData, RangeValue, SourceOperator};

    struct Fixture {
        store: MemoryStore,
        chain: DivisionChain,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let smpl = store.add_sample(0, 0, vec![0.0; 1000], 22050, 57);
        store.set_value(smpl, A::SampleStartLoop, 100).unwrap();
        store.set_value(smpl, A::SampleEndLoop, 900).unwrap();
        let inst = store.add_instrument(0, 0);
        let inst_div = store.link_sample(inst, smpl);
        let prst = store.add_preset(0, 3);
        let prst_div = store.link_instrument(prst, inst);
        Fixture {
            store,
            chain: DivisionChain {
                preset_division: Some(prst_div),
                instrument_division: Some(inst_div),
                sample: smpl,
            },
        }
    }

    fn build(f: &Fixture, key: i32, vel: i32) -> VoiceParam {
        VoiceParam::new(&f.store, &f.chain, 0, key, vel, true)
    }

    /// CC1 (mod wheel) fully up driving `destination` by `amount`.
    fn mod_wheel(destination: AttributeType, amount: i16) -> ModulatorData {
        ModulatorData::new(SourceOperator::midi_cc(1, false, false, CurveType::Linear), destination, amount)
    }

    fn modulated(f: &Fixture, attribute: AttributeType) -> f64 {
        let mut p = build(f, 60, 100);
        let mut controllers = ControllerValues::default();
        controllers.cc[1] = 127;
        assert!(p.compute_modulations(&controllers));
        p.get_double(attribute)
    }

    #[test]
    fn reads_sample_record() {
        let f = fixture();
        let p = build(&f, 60, 100);
        assert_eq!(p.sample_rate(), 22050);
        assert_eq!(p.root_key(), 57);
        assert_eq!(p.get_position(A::StartLoopAddrsOffset), 100);
        assert_eq!(p.get_position(A::EndLoopAddrsOffset), 900);
        assert_eq!(p.get_position(A::EndAddrsOffset), 1000);
        assert_eq!(p.preset_id(), 3);
    }

    #[test]
    fn instrument_division_overrides_global() {
        let f = fixture();
        let inst = f.chain.instrument_division.unwrap();
        f.store.set_value(inst.parent(), A::CoarseTune, 5).unwrap();
        f.store.set_value(inst.parent(), A::FineTune, 7).unwrap();
        f.store.set_value(inst, A::CoarseTune, 2).unwrap();
        let p = build(&f, 60, 100);
        assert_eq!(p.get_integer(A::CoarseTune), 2);
        assert_eq!(p.get_integer(A::FineTune), 7);
    }

    #[test]
    fn preset_values_are_offsets() {
        let f = fixture();
        let inst = f.chain.instrument_division.unwrap();
        let prst = f.chain.preset_division.unwrap();
        f.store.set_value(inst, A::CoarseTune, 2).unwrap();
        f.store.set_value(prst.parent(), A::CoarseTune, 1).unwrap();
        f.store.set_value(prst, A::CoarseTune, 3).unwrap();
        // Instrument-only generators are ignored at preset level.
        f.store.set_value(prst, A::OverridingRootKey, 10).unwrap();
        let p = build(&f, 60, 100);
        assert_eq!(p.get_integer(A::CoarseTune), 5);
        assert_eq!(p.root_key(), 57);
    }

    #[test]
    fn loop_offsets_apply_fine_and_coarse() {
        let f = fixture();
        let inst = f.chain.instrument_division.unwrap();
        f.store.set_value(inst, A::StartLoopAddrsOffset, 10).unwrap();
        f.store.set_value(inst, A::EndAddrsOffset, -5000).unwrap();
        let p = build(&f, 60, 100);
        assert_eq!(p.get_position(A::StartLoopAddrsOffset), 110);
        assert_eq!(p.get_position(A::EndAddrsOffset), 0, "clamped to the sample");
    }

    #[test]
    fn unit_conversions() {
        let f = fixture();
        let mut p = build(&f, 60, 127);
        p.compute_modulations(&ControllerValues::default());
        assert!((p.get_double(A::AttackVolEnv) - 2f64.powf(-10.0)).abs() < 1e-12);
        assert!((p.get_double(A::InitialFilterFc) - 19912.0).abs() < 5.0);
        assert!((p.get_double(A::FreqModLfo) - 8.176).abs() < 1e-3);
        assert_eq!(p.get_double(A::SustainModEnv), 1.0);
    }

    #[test]
    fn key_scaling_shortens_decay_for_high_keys() {
        let f = fixture();
        let inst = f.chain.instrument_division.unwrap();
        f.store.set_value(inst, A::DecayVolEnv, 0).unwrap();
        f.store.set_value(inst, A::KeynumToVolEnvDecay, 100).unwrap();
        let low = build(&f, 48, 100);
        let high = build(&f, 72, 100);
        assert!(high.get_double(A::DecayVolEnv) < low.get_double(A::DecayVolEnv));
        assert!((build(&f, 60, 100).get_double(A::DecayVolEnv) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn velocity_modulates_attenuation() {
        let f = fixture();
        let mut soft = build(&f, 60, 30);
        let mut loud = build(&f, 60, 127);
        let mut controllers = ControllerValues::default();
        controllers.cc[7] = 127;
        assert!(soft.compute_modulations(&controllers));
        assert!(loud.compute_modulations(&controllers));
        assert!(soft.get_double(A::InitialAttenuation) > loud.get_double(A::InitialAttenuation));
        assert_eq!(loud.get_double(A::InitialAttenuation), 0.0);
    }

    #[test]
    fn forced_key_and_velocity() {
        let f = fixture();
        let inst = f.chain.instrument_division.unwrap();
        f.store.set_value(inst, A::Keynum, 40).unwrap();
        f.store
            .set(inst, A::KeyRange, AttributeValue::Range(RangeValue::new(0, 127)))
            .unwrap();
        let p = build(&f, 60, 100);
        assert_eq!(p.key(), 60);
        assert_eq!(p.key_for_computation(), 40);
    }

    #[test]
    fn preview_voice_pans_by_link() {
        let f = fixture();
        let mut p = VoiceParam::new(&f.store, &DivisionChain::sample_only(f.chain.sample), 0, -1, 127, true);
        p.prepare_for_sample(-1, SampleLink::Left);
        assert_eq!(p.get_double(A::Pan), -0.5);
        assert_eq!(p.key_for_computation(), 57);
    }

    #[test]
    fn division_modulator_overrides_global_one() {
        let f = fixture();
        let inst = f.chain.instrument_division.unwrap();
        f.store
            .set_modulators(inst.parent(), vec![mod_wheel(A::ModLfoToPitch, 100)])
            .unwrap();
        assert_eq!(modulated(&f, A::ModLfoToPitch), 100.0);

        f.store.set_modulators(inst, vec![mod_wheel(A::ModLfoToPitch, 300)]).unwrap();
        assert_eq!(modulated(&f, A::ModLfoToPitch), 300.0);
    }

    #[test]
    fn division_modulator_replaces_default_one() {
        let f = fixture();
        // The implicit CC1 to vibrato depth modulator has amount 50.
        assert_eq!(modulated(&f, A::VibLfoToPitch), 50.0);

        let inst = f.chain.instrument_division.unwrap();
        f.store.set_modulators(inst, vec![mod_wheel(A::VibLfoToPitch, 200)]).unwrap();
        assert_eq!(modulated(&f, A::VibLfoToPitch), 200.0);
    }

    #[test]
    fn preset_modulators_add_to_instrument_ones() {
        let f = fixture();
        let inst = f.chain.instrument_division.unwrap();
        let prst = f.chain.preset_division.unwrap();
        f.store.set_modulators(inst, vec![mod_wheel(A::ModLfoToPitch, 100)]).unwrap();
        f.store.set_modulators(prst, vec![mod_wheel(A::ModLfoToPitch, 40)]).unwrap();
        assert_eq!(modulated(&f, A::ModLfoToPitch), 140.0);

        // A preset global and its division merge like instrument levels do.
        f.store
            .set_modulators(prst.parent(), vec![mod_wheel(A::ModLfoToPitch, 900)])
            .unwrap();
        assert_eq!(modulated(&f, A::ModLfoToPitch), 140.0);
    }
}
