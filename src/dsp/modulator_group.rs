//! Modulator graph of one division level, evaluated once per control tick.
//!
//! Modulators live in an arena addressed by position. Links between them are
//! edges `ModulatorTarget::Modulator(index)`; cycles are allowed and
//! evaluation is bounded to one pass per modulator.

use crate::dsp::modulator::{
    Computation, ModulationInputs, ModulatorTarget, ParameterBank, ParameterModulator, default_modulators,
};
use crate::store::ModulatorData;

/// Outcome of [`ModulatorGroup::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub passes: usize,
    pub converged: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ModulatorGroup {
    is_preset: bool,
    modulators: Vec<ParameterModulator>,
}

impl ModulatorGroup {
    pub fn new(is_preset: bool) -> Self {
        ModulatorGroup {
            is_preset,
            modulators: Vec::new(),
        }
    }

    pub fn is_preset(&self) -> bool {
        self.is_preset
    }

    pub fn len(&self) -> usize {
        self.modulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modulators.is_empty()
    }

    pub fn modulators(&self) -> &[ParameterModulator] {
        &self.modulators
    }

    /// Seed the implicit modulators. Preset groups have none.
    pub fn load_default_modulators(&mut self, vel_to_filter: bool) {
        if self.is_preset {
            return;
        }
        let defaults = default_modulators(vel_to_filter);
        self.load_modulators(&defaults);
    }

    /// Merge a batch of definitions: identical modulators are overwritten in
    /// place, others appended. Links of appended modulators resolve against
    /// the indices of the same batch.
    pub fn load_modulators(&mut self, list: &[ModulatorData]) {
        let existing = self.modulators.len();

        for data in list {
            let merged = self.modulators.iter_mut().any(|m| m.merge(data));
            if !merged {
                self.modulators.push(ParameterModulator::new(*data));
            }
        }

        for i in existing..self.modulators.len() {
            let Some(wanted) = self.modulators[i].data().target_modulator() else {
                continue;
            };
            let found = (existing..self.modulators.len()).find(|&j| j != i && self.modulators[j].index() == wanted);
            if let Some(j) = found {
                self.modulators[i].set_target(ModulatorTarget::Modulator(j));
                self.modulators[j].expect_input();
            }
        }
    }

    /// Evaluate every modulator and add the outputs to `parameters`.
    ///
    /// Runs at most one pass per modulator. A graph with a cycle never
    /// settles; its pending modulators contribute nothing this tick.
    pub fn process(&mut self, parameters: &mut ParameterBank, inputs: &ModulationInputs<'_>) -> ProcessOutcome {
        for m in &mut self.modulators {
            m.initialize();
        }

        let budget = self.modulators.len();
        let mut passes = 0;
        let mut converged = budget == 0;
        while !converged && passes < budget {
            passes += 1;
            converged = true;
            for i in 0..self.modulators.len() {
                match self.modulators[i].compute_output(inputs) {
                    Computation::Pending => converged = false,
                    Computation::Settled => {}
                    Computation::Emitted(value) => match self.modulators[i].target() {
                        ModulatorTarget::Parameter(attribute) => parameters[attribute].add_modulation(value),
                        ModulatorTarget::Modulator(j) => self.modulators[j].receive(value),
                        ModulatorTarget::None => {}
                    },
                }
            }
        }
        ProcessOutcome { passes, converged }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::ControllerValues;
    use crate::store::{AttributeType, CurveType, GeneralController, SourceOperator};

    fn cc(n: u8) -> SourceOperator {
        SourceOperator::midi_cc(n, false, false, CurveType::Linear)
    }

    fn link() -> SourceOperator {
        SourceOperator::general(GeneralController::Link, false, false, CurveType::Linear)
    }

    fn run(group: &mut ModulatorGroup, controllers: &ControllerValues) -> (ParameterBank, ProcessOutcome) {
        let mut bank = ParameterBank::default();
        let inputs = ModulationInputs {
            key: 60,
            velocity: 100,
            controllers,
        };
        let outcome = group.process(&mut bank, &inputs);
        (bank, outcome)
    }

    #[test]
    fn defaults_only_at_instrument_level() {
        let mut preset = ModulatorGroup::new(true);
        preset.load_default_modulators(true);
        assert!(preset.is_empty());

        let mut inst = ModulatorGroup::new(false);
        inst.load_default_modulators(true);
        assert_eq!(inst.len(), 10);
    }

    #[test]
    fn identical_modulator_is_overwritten() {
        let mut group = ModulatorGroup::new(false);
        group.load_default_modulators(true);
        let mod_wheel = ModulatorData::new(cc(1), AttributeType::VibLfoToPitch, 200);
        group.load_modulators(&[mod_wheel]);
        assert_eq!(group.len(), 10);

        let mut controllers = ControllerValues::default();
        controllers.cc[1] = 127;
        let (bank, outcome) = run(&mut group, &controllers);
        assert!(outcome.converged);
        assert!((bank[AttributeType::VibLfoToPitch].modulation() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn acyclic_chain_converges_within_budget() {
        // 0 -> 1 -> 2 -> pan, listed in reverse so each pass settles one link.
        let mods = [
            ModulatorData::new(link(), AttributeType::Pan, 1000).with_index(2),
            ModulatorData::linked(link(), 2, 32767).with_index(1),
            ModulatorData::linked(cc(20), 1, 16384).with_index(0),
        ];
        let mut group = ModulatorGroup::new(false);
        group.load_modulators(&mods);

        let mut controllers = ControllerValues::default();
        controllers.cc[20] = 127;
        let (bank, outcome) = run(&mut group, &controllers);
        assert!(outcome.converged);
        assert!(outcome.passes <= mods.len(), "took {} passes", outcome.passes);
        assert_eq!(outcome.passes, 3);
        let pan = bank[AttributeType::Pan].modulation();
        assert!(pan > 0.0 && pan <= 1000.0, "pan {pan}");
    }

    #[test]
    fn cycle_stops_after_exactly_m_passes() {
        let mods = [
            ModulatorData::linked(link(), 1, 100).with_index(0),
            ModulatorData::linked(link(), 2, 100).with_index(1),
            ModulatorData::linked(link(), 0, 100).with_index(2),
            ModulatorData::new(cc(1), AttributeType::Pan, 10).with_index(3),
        ];
        let mut group = ModulatorGroup::new(false);
        group.load_modulators(&mods);

        let mut controllers = ControllerValues::default();
        controllers.cc[1] = 127;
        let (bank, outcome) = run(&mut group, &controllers);
        assert!(!outcome.converged);
        assert_eq!(outcome.passes, mods.len());
        // The modulator outside the cycle still delivered its output.
        assert_eq!(bank[AttributeType::Pan].modulation(), 10.0);
    }

    #[test]
    fn links_resolve_within_their_batch_only() {
        let mut group = ModulatorGroup::new(false);
        group.load_modulators(&[ModulatorData::new(cc(2), AttributeType::Pan, 10).with_index(0)]);
        // Index 0 of the second batch is the one below, not the first batch's.
        group.load_modulators(&[
            ModulatorData::new(link(), AttributeType::ReverbEffectsSend, 1000).with_index(0),
            ModulatorData::linked(cc(3), 0, 32767).with_index(1),
        ]);
        assert_eq!(group.modulators()[2].target(), ModulatorTarget::Modulator(1));
        assert_eq!(group.modulators()[0].target(), ModulatorTarget::Parameter(AttributeType::Pan));
    }

    #[test]
    fn unknown_link_target_drops_output() {
        let mut group = ModulatorGroup::new(false);
        group.load_modulators(&[ModulatorData::linked(cc(3), 7, 100)]);
        assert_eq!(group.modulators()[0].target(), ModulatorTarget::None);
        let (_, outcome) = run(&mut group, &ControllerValues::default());
        assert!(outcome.converged);
    }
}
