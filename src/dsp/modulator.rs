//! Modulated parameters and single modulator evaluation.

use std::ops::{Index, IndexMut};

use crate::controls::ControllerValues;
use crate::store::{
    AttributeType, CurveType, GENERATOR_COUNT, GeneralController, ModulatorData, SourceOperator,
    TRANSFORM_ABSOLUTE,
};

// ── Parameters ──────────────────────────────────────────────

/// One synthesis parameter: a base value resolved once at voice creation
/// plus the modulation accumulated during the current control tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModulatedParameter {
    attribute: AttributeType,
    base: f64,
    modulation: f64,
}

impl ModulatedParameter {
    pub fn new(attribute: AttributeType) -> Self {
        ModulatedParameter {
            attribute,
            base: attribute.default_value() as f64,
            modulation: 0.0,
        }
    }

    pub fn attribute(&self) -> AttributeType {
        self.attribute
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn set_base(&mut self, value: f64) {
        self.base = value;
    }

    pub fn add_to_base(&mut self, value: f64) {
        self.base += value;
    }

    pub fn clear_modulation(&mut self) {
        self.modulation = 0.0;
    }

    pub fn add_modulation(&mut self, value: f64) {
        self.modulation += value;
    }

    pub fn modulation(&self) -> f64 {
        self.modulation
    }

    pub fn modulated(&self) -> f64 {
        self.base + self.modulation
    }
}

/// The per-voice parameter table, one slot per generator.
#[derive(Debug, Clone)]
pub struct ParameterBank {
    slots: Vec<ModulatedParameter>,
}

impl Default for ParameterBank {
    fn default() -> Self {
        ParameterBank {
            slots: AttributeType::generators().map(ModulatedParameter::new).collect(),
        }
    }
}

impl ParameterBank {
    pub fn clear_modulations(&mut self) {
        for p in &mut self.slots {
            p.clear_modulation();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModulatedParameter> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// Non-generator attributes all share the EndOper slot, which nothing reads.
fn slot_of(attribute: AttributeType) -> usize {
    attribute.slot().unwrap_or(GENERATOR_COUNT - 1)
}

impl Index<AttributeType> for ParameterBank {
    type Output = ModulatedParameter;

    fn index(&self, attribute: AttributeType) -> &ModulatedParameter {
        &self.slots[slot_of(attribute)]
    }
}

impl IndexMut<AttributeType> for ParameterBank {
    fn index_mut(&mut self, attribute: AttributeType) -> &mut ModulatedParameter {
        &mut self.slots[slot_of(attribute)]
    }
}

// ── Modulator inputs ────────────────────────────────────────

/// Everything a modulator source can read during a control tick.
#[derive(Debug, Clone, Copy)]
pub struct ModulationInputs<'a> {
    pub key: i32,
    pub velocity: i32,
    pub controllers: &'a ControllerValues,
}

/// Where a modulator sends its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulatorTarget {
    /// Destination is not a known generator; output is dropped.
    None,
    Parameter(AttributeType),
    /// Another modulator of the same group, by position.
    Modulator(usize),
}

/// Result of one evaluation attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Computation {
    /// Still waiting on linked inputs.
    Pending,
    /// Output already delivered earlier this tick.
    Settled,
    /// Output computed now; the caller routes it to the target.
    Emitted(f64),
}

/// A single modulator instance within a group.
#[derive(Debug, Clone)]
pub struct ParameterModulator {
    data: ModulatorData,
    target: ModulatorTarget,
    expected_inputs: usize,
    received_inputs: usize,
    input: f64,
    computed: bool,
}

impl ParameterModulator {
    pub fn new(data: ModulatorData) -> Self {
        let target = if data.target_modulator().is_some() {
            ModulatorTarget::None
        } else {
            AttributeType::generator(data.destination).map_or(ModulatorTarget::None, ModulatorTarget::Parameter)
        };
        ParameterModulator {
            data,
            target,
            expected_inputs: 0,
            received_inputs: 0,
            input: 0.0,
            computed: false,
        }
    }

    pub fn data(&self) -> &ModulatorData {
        &self.data
    }

    pub fn index(&self) -> u16 {
        self.data.index
    }

    pub fn target(&self) -> ModulatorTarget {
        self.target
    }

    pub(crate) fn set_target(&mut self, target: ModulatorTarget) {
        self.target = target;
    }

    pub(crate) fn expect_input(&mut self) {
        self.expected_inputs += 1;
    }

    /// Overwrite amount and secondary settings if `other` is the same
    /// modulator. Returns whether it was merged.
    pub fn merge(&mut self, other: &ModulatorData) -> bool {
        if !self.data.same_identity(other) {
            return false;
        }
        self.data.amount = other.amount;
        self.data.index = other.index;
        true
    }

    /// Reset the per-tick working state.
    pub fn initialize(&mut self) {
        self.received_inputs = 0;
        self.input = 0.0;
        self.computed = false;
    }

    /// Receive the output of a modulator linked to this one.
    pub fn receive(&mut self, value: f64) {
        self.input += value;
        self.received_inputs += 1;
    }

    /// Try to compute the output for this tick.
    pub fn compute_output(&mut self, inputs: &ModulationInputs<'_>) -> Computation {
        if self.computed {
            return Computation::Settled;
        }
        if self.received_inputs < self.expected_inputs {
            return Computation::Pending;
        }
        self.computed = true;

        let primary = self.source_value(self.data.source, inputs);
        let secondary = self.source_value(self.data.amount_source, inputs);
        let mut value = self.data.amount as f64 * primary * secondary;
        if self.data.transform == TRANSFORM_ABSOLUTE {
            value = value.abs();
        }
        Computation::Emitted(value)
    }

    fn source_value(&self, source: SourceOperator, inputs: &ModulationInputs<'_>) -> f64 {
        let c = inputs.controllers;
        let raw = if source.is_cc() {
            c.cc[source.index() as usize] as f64 / 127.0
        } else {
            match source.controller() {
                None | Some(GeneralController::NoController) => return 1.0,
                // Linked inputs arrive in generator units.
                Some(GeneralController::Link) => {
                    return (self.input / 32768.0).clamp(-1.0, 1.0);
                }
                Some(GeneralController::NoteOnVelocity) => inputs.velocity as f64 / 127.0,
                Some(GeneralController::NoteOnKey) => inputs.key as f64 / 127.0,
                Some(GeneralController::PolyPressure) => {
                    let key = inputs.key.clamp(0, 127) as usize;
                    c.poly_pressure[key] as f64 / 127.0
                }
                Some(GeneralController::ChannelPressure) => c.channel_pressure as f64 / 127.0,
                Some(GeneralController::PitchWheel) => (c.pitch_bend + 1.0) / 2.0,
                Some(GeneralController::PitchWheelSensitivity) => c.bend_sensitivity / 127.0,
            }
        };
        map_source(source, raw)
    }
}

/// Apply direction, polarity and curve to a normalized controller value.
pub fn map_source(source: SourceOperator, normalized: f64) -> f64 {
    let mut x = normalized.clamp(0.0, 1.0);
    if source.is_descending() {
        x = 1.0 - x;
    }
    let curve = source.curve();
    if source.is_bipolar() {
        if x >= 0.5 {
            apply_curve(curve, 2.0 * x - 1.0)
        } else {
            -apply_curve(curve, 1.0 - 2.0 * x)
        }
    } else {
        apply_curve(curve, x)
    }
}

fn concave(x: f64) -> f64 {
    if x >= 1.0 {
        return 1.0;
    }
    (-(40.0 / 96.0) * (1.0 - x).log10()).clamp(0.0, 1.0)
}

fn apply_curve(curve: CurveType, x: f64) -> f64 {
    match curve {
        CurveType::Linear => x,
        CurveType::Concave => concave(x),
        CurveType::Convex => 1.0 - concave(1.0 - x),
        CurveType::Switch => {
            if x >= 0.5 {
                1.0
            } else {
                0.0
            }
        }
    }
}

// ── Default modulators ──────────────────────────────────────

/// The implicit modulators every instrument division starts with.
/// `vel_to_filter` toggles the velocity to filter cutoff modulator.
pub fn default_modulators(vel_to_filter: bool) -> Vec<ModulatorData> {
    use AttributeType as A;
    use CurveType::{Concave, Linear};
    use GeneralController as G;

    let mut list = vec![
        ModulatorData::new(SourceOperator::general(G::NoteOnVelocity, true, false, Concave), A::InitialAttenuation, 960),
        ModulatorData::new(SourceOperator::general(G::ChannelPressure, false, false, Linear), A::VibLfoToPitch, 50),
        ModulatorData::new(SourceOperator::midi_cc(1, false, false, Linear), A::VibLfoToPitch, 50),
        ModulatorData::new(SourceOperator::midi_cc(7, true, false, Concave), A::InitialAttenuation, 960),
        ModulatorData::new(SourceOperator::midi_cc(10, false, true, Linear), A::Pan, 1000),
        ModulatorData::new(SourceOperator::midi_cc(11, true, false, Concave), A::InitialAttenuation, 960),
        ModulatorData::new(SourceOperator::midi_cc(91, false, false, Linear), A::ReverbEffectsSend, 200),
        ModulatorData::new(SourceOperator::midi_cc(93, false, false, Linear), A::ChorusEffectsSend, 200),
        ModulatorData::new(SourceOperator::general(G::PitchWheel, false, true, Linear), A::FineTune, 12700)
            .with_amount_source(SourceOperator::general(G::PitchWheelSensitivity, false, false, Linear)),
    ];
    if vel_to_filter {
        list.insert(
            1,
            ModulatorData::new(SourceOperator::general(G::NoteOnVelocity, true, false, Linear), A::InitialFilterFc, -2400),
        );
    }
    for (i, m) in list.iter_mut().enumerate() {
        m.index = i as u16;
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(controllers: &ControllerValues, key: i32, velocity: i32) -> ModulationInputs<'_> {
        ModulationInputs {
            key,
            velocity,
            controllers,
        }
    }

    #[test]
    fn curves_are_monotonic_and_bounded() {
        for curve in [CurveType::Linear, CurveType::Concave, CurveType::Convex, CurveType::Switch] {
            let mut last = -1.0;
            for i in 0..=100 {
                let v = apply_curve(curve, i as f64 / 100.0);
                assert!((0.0..=1.0).contains(&v), "{curve:?} out of range: {v}");
                assert!(v >= last, "{curve:?} not monotonic at {i}");
                last = v;
            }
            assert_eq!(apply_curve(curve, 0.0), 0.0);
            assert_eq!(apply_curve(curve, 1.0), 1.0);
        }
    }

    #[test]
    fn bipolar_source_is_centered() {
        let src = SourceOperator::midi_cc(10, false, true, CurveType::Linear);
        assert!((map_source(src, 0.5)).abs() < 1e-9);
        assert!((map_source(src, 1.0) - 1.0).abs() < 1e-9);
        assert!((map_source(src, 0.0) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn velocity_attenuation_is_zero_at_full_velocity() {
        let controllers = ControllerValues::default();
        let mut m = ParameterModulator::new(default_modulators(true)[0]);
        m.initialize();
        assert_eq!(m.compute_output(&inputs(&controllers, 60, 127)), Computation::Emitted(0.0));

        m.initialize();
        match m.compute_output(&inputs(&controllers, 60, 40)) {
            Computation::Emitted(v) => assert!(v > 0.0 && v <= 960.0, "got {v}"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.compute_output(&inputs(&controllers, 60, 40)), Computation::Settled);
    }

    #[test]
    fn pitch_wheel_scales_with_sensitivity() {
        let mut controllers = ControllerValues::default();
        controllers.pitch_bend = 1.0;
        controllers.bend_sensitivity = 2.0;
        let wheel = *default_modulators(false).last().expect("pitch wheel modulator");
        let mut m = ParameterModulator::new(wheel);
        m.initialize();
        match m.compute_output(&inputs(&controllers, 60, 100)) {
            Computation::Emitted(v) => assert!((v - 200.0).abs() < 1e-6, "got {v}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn linked_input_waits_for_sources() {
        let controllers = ControllerValues::default();
        let link = SourceOperator::general(GeneralController::Link, false, false, CurveType::Linear);
        let mut m = ParameterModulator::new(ModulatorData::new(link, AttributeType::Pan, 100));
        m.expect_input();
        m.initialize();
        assert_eq!(m.compute_output(&inputs(&controllers, 60, 100)), Computation::Pending);
        m.receive(16384.0);
        assert_eq!(m.compute_output(&inputs(&controllers, 60, 100)), Computation::Emitted(50.0));
    }

    #[test]
    fn absolute_transform() {
        let mut controllers = ControllerValues::default();
        controllers.cc[10] = 0;
        let src = SourceOperator::midi_cc(10, false, true, CurveType::Linear);
        let mut data = ModulatorData::new(src, AttributeType::Pan, 1000);
        data.transform = TRANSFORM_ABSOLUTE;
        let mut m = ParameterModulator::new(data);
        m.initialize();
        // CC10 at 0 maps to -1 before the transform.
        assert_eq!(m.compute_output(&inputs(&controllers, 60, 100)), Computation::Emitted(1000.0));
    }

    #[test]
    fn default_set_size_follows_filter_option() {
        assert_eq!(default_modulators(true).len(), 10);
        assert_eq!(default_modulators(false).len(), 9);
        let indices: Vec<u16> = default_modulators(true).iter().map(|m| m.index).collect();
        assert_eq!(indices, (0..10).collect::<Vec<u16>>());
    }
}
