//! Process-wide engine controls shared by every voice of every engine.
//!
//! The control domain writes atomics; each engine copies them into a
//! [`ControlSnapshot`] once per render tick so all its voices see one
//! consistent state for the whole buffer. Release-by-key and stop-all are
//! generation counters: a voice remembers the generation it was born in and
//! releases when the counter moves past it.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Key slots: preview keys -2 and -1, then MIDI keys 0..=127.
pub const KEY_SLOTS: usize = 130;

pub fn key_slot(key: i32) -> Option<usize> {
    let slot = key + 2;
    (0..KEY_SLOTS as i32).contains(&slot).then_some(slot as usize)
}

/// `f32` stored in an `AtomicU32`.
#[derive(Debug, Default)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(value: f32) -> Self {
        AtomicF32(AtomicU32::new(value.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// MIDI controller state read by modulator sources.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerValues {
    pub cc: [u8; 128],
    pub poly_pressure: [u8; 128],
    pub channel_pressure: u8,
    /// Pitch bend in [-1, 1].
    pub pitch_bend: f64,
    /// Pitch bend range in semitones.
    pub bend_sensitivity: f64,
}

impl Default for ControllerValues {
    fn default() -> Self {
        let mut cc = [0u8; 128];
        cc[7] = 100;
        cc[10] = 64;
        cc[11] = 127;
        ControllerValues {
            cc,
            poly_pressure: [0; 128],
            channel_pressure: 0,
            pitch_bend: 0.0,
            bend_sensitivity: 2.0,
        }
    }
}

/// A live override of a preview voice setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreviewOverride<T> {
    pub value: Option<T>,
    /// Also applies to the stereo-linked voice (key -2).
    pub linked: bool,
}

impl<T: Copy> PreviewOverride<T> {
    /// Value for a voice on `key`, if overridden.
    pub fn for_key(&self, key: i32) -> Option<T> {
        match key {
            -1 => self.value,
            -2 if self.linked => self.value,
            _ => None,
        }
    }
}

/// Overrides for the sample preview voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreviewOverrides {
    pub start_loop: PreviewOverride<u32>,
    pub end_loop: PreviewOverride<u32>,
    pub pitch_correction: PreviewOverride<i32>,
}

/// Everything a voice reads from the shared controls during one tick.
#[derive(Debug, Clone)]
pub struct ControlSnapshot {
    /// Master gain, linear.
    pub gain: f64,
    /// Extra gain of preview voices, linear.
    pub sample_gain: f64,
    pub stereo: bool,
    pub loop_enabled: bool,
    /// A4 reference, Hz.
    pub tuning_fork: f64,
    /// Offset per pitch class, cents.
    pub temperament: [f64; 12],
    pub release_generations: [u64; KEY_SLOTS],
    pub stop_generation: u64,
    pub preview: PreviewOverrides,
    pub controllers: ControllerValues,
}

impl Default for ControlSnapshot {
    fn default() -> Self {
        ControlSnapshot {
            gain: 1.0,
            sample_gain: 1.0,
            stereo: true,
            loop_enabled: true,
            tuning_fork: 440.0,
            temperament: [0.0; 12],
            release_generations: [0; KEY_SLOTS],
            stop_generation: 0,
            preview: PreviewOverrides::default(),
            controllers: ControllerValues::default(),
        }
    }
}

impl ControlSnapshot {
    /// Generation a voice on `key` is born in.
    pub fn generations_for(&self, key: i32) -> (u64, u64) {
        let release = key_slot(key).map_or(0, |slot| self.release_generations[slot]);
        (release, self.stop_generation)
    }

    /// True if a release for `key` was requested after `generation`.
    pub fn is_key_released(&self, key: i32, generation: u64) -> bool {
        key_slot(key).is_some_and(|slot| self.release_generations[slot] != generation)
    }
}

/// Process-wide controls, written by the control domain.
#[derive(Debug)]
pub struct EngineControls {
    gain_db: AtomicF32,
    sample_gain_db: AtomicF32,
    stereo: AtomicBool,
    loop_enabled: AtomicBool,
    tuning_fork: AtomicF32,
    temperament: [AtomicF32; 12],
    release_generations: [AtomicU64; KEY_SLOTS],
    stop_generation: AtomicU64,

    // Preview overrides; -1 means unset.
    start_loop: AtomicI64,
    end_loop: AtomicI64,
    pitch_correction: AtomicI32,
    pitch_correction_set: AtomicBool,
    start_loop_linked: AtomicBool,
    end_loop_linked: AtomicBool,
    pitch_correction_linked: AtomicBool,

    cc: [AtomicU8; 128],
    poly_pressure: [AtomicU8; 128],
    channel_pressure: AtomicU8,
    pitch_bend: AtomicF32,
    bend_sensitivity: AtomicF32,
}

impl Default for EngineControls {
    fn default() -> Self {
        let defaults = ControllerValues::default();
        EngineControls {
            gain_db: AtomicF32::new(0.0),
            sample_gain_db: AtomicF32::new(0.0),
            stereo: AtomicBool::new(true),
            loop_enabled: AtomicBool::new(true),
            tuning_fork: AtomicF32::new(440.0),
            temperament: std::array::from_fn(|_| AtomicF32::new(0.0)),
            release_generations: std::array::from_fn(|_| AtomicU64::new(0)),
            stop_generation: AtomicU64::new(0),
            start_loop: AtomicI64::new(-1),
            end_loop: AtomicI64::new(-1),
            pitch_correction: AtomicI32::new(0),
            pitch_correction_set: AtomicBool::new(false),
            start_loop_linked: AtomicBool::new(false),
            end_loop_linked: AtomicBool::new(false),
            pitch_correction_linked: AtomicBool::new(false),
            cc: std::array::from_fn(|i| AtomicU8::new(defaults.cc[i])),
            poly_pressure: std::array::from_fn(|_| AtomicU8::new(0)),
            channel_pressure: AtomicU8::new(0),
            pitch_bend: AtomicF32::new(0.0),
            bend_sensitivity: AtomicF32::new(defaults.bend_sensitivity as f32),
        }
    }
}

fn db_to_linear(db: f32) -> f64 {
    10f64.powf(db as f64 / 20.0)
}

impl EngineControls {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Writers (control domain) ──

    pub fn set_gain(&self, db: f32) {
        self.gain_db.store(db);
    }

    pub fn set_sample_gain(&self, db: f32) {
        self.sample_gain_db.store(db);
    }

    pub fn set_stereo(&self, stereo: bool) {
        self.stereo.store(stereo, Ordering::Relaxed);
    }

    pub fn is_stereo(&self) -> bool {
        self.stereo.load(Ordering::Relaxed)
    }

    pub fn set_loop_enabled(&self, enabled: bool) {
        self.loop_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_tuning_fork(&self, hz: f32) {
        self.tuning_fork.store(hz);
    }

    pub fn set_temperament(&self, cents: &[f64; 12]) {
        for (slot, value) in self.temperament.iter().zip(cents) {
            slot.store(*value as f32);
        }
    }

    /// Ask every voice currently on `key` to release.
    pub fn release_key(&self, key: i32) {
        if let Some(slot) = key_slot(key) {
            self.release_generations[slot].fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Ask every current voice to stop quickly.
    pub fn stop_all(&self) {
        self.stop_generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_start_loop(&self, start: u32, linked: bool) {
        self.start_loop.store(start as i64, Ordering::Relaxed);
        self.start_loop_linked.store(linked, Ordering::Relaxed);
    }

    pub fn set_end_loop(&self, end: u32, linked: bool) {
        self.end_loop.store(end as i64, Ordering::Relaxed);
        self.end_loop_linked.store(linked, Ordering::Relaxed);
    }

    pub fn set_pitch_correction(&self, cents: i32, linked: bool) {
        self.pitch_correction.store(cents, Ordering::Relaxed);
        self.pitch_correction_set.store(true, Ordering::Relaxed);
        self.pitch_correction_linked.store(linked, Ordering::Relaxed);
    }

    /// Forget preview overrides; a new preview uses the sample's own values.
    pub fn clear_preview_overrides(&self) {
        self.start_loop.store(-1, Ordering::Relaxed);
        self.end_loop.store(-1, Ordering::Relaxed);
        self.pitch_correction_set.store(false, Ordering::Relaxed);
    }

    pub fn set_controller(&self, cc: u8, value: u8) {
        if let Some(slot) = self.cc.get(cc as usize) {
            slot.store(value.min(127), Ordering::Relaxed);
        }
    }

    pub fn set_pitch_bend(&self, bend: f32) {
        self.pitch_bend.store(bend.clamp(-1.0, 1.0));
    }

    pub fn set_bend_sensitivity(&self, semitones: f32) {
        self.bend_sensitivity.store(semitones.clamp(0.0, 127.0));
    }

    pub fn set_channel_pressure(&self, value: u8) {
        self.channel_pressure.store(value.min(127), Ordering::Relaxed);
    }

    pub fn set_poly_pressure(&self, key: u8, value: u8) {
        if let Some(slot) = self.poly_pressure.get(key as usize) {
            slot.store(value.min(127), Ordering::Relaxed);
        }
    }

    // ── Reader (render domain) ──

    /// Copy the current state into `snapshot` without allocating.
    pub fn refresh(&self, snapshot: &mut ControlSnapshot) {
        snapshot.gain = db_to_linear(self.gain_db.load());
        snapshot.sample_gain = db_to_linear(self.sample_gain_db.load());
        snapshot.stereo = self.stereo.load(Ordering::Relaxed);
        snapshot.loop_enabled = self.loop_enabled.load(Ordering::Relaxed);
        snapshot.tuning_fork = self.tuning_fork.load() as f64;
        for (dst, src) in snapshot.temperament.iter_mut().zip(&self.temperament) {
            *dst = src.load() as f64;
        }
        for (dst, src) in snapshot.release_generations.iter_mut().zip(&self.release_generations) {
            *dst = src.load(Ordering::Acquire);
        }
        snapshot.stop_generation = self.stop_generation.load(Ordering::Acquire);

        let start = self.start_loop.load(Ordering::Relaxed);
        let end = self.end_loop.load(Ordering::Relaxed);
        snapshot.preview = PreviewOverrides {
            start_loop: PreviewOverride {
                value: (start >= 0).then_some(start as u32),
                linked: self.start_loop_linked.load(Ordering::Relaxed),
            },
            end_loop: PreviewOverride {
                value: (end >= 0).then_some(end as u32),
                linked: self.end_loop_linked.load(Ordering::Relaxed),
            },
            pitch_correction: PreviewOverride {
                value: self
                    .pitch_correction_set
                    .load(Ordering::Relaxed)
                    .then(|| self.pitch_correction.load(Ordering::Relaxed)),
                linked: self.pitch_correction_linked.load(Ordering::Relaxed),
            },
        };

        let controllers = &mut snapshot.controllers;
        for (dst, src) in controllers.cc.iter_mut().zip(&self.cc) {
            *dst = src.load(Ordering::Relaxed);
        }
        for (dst, src) in controllers.poly_pressure.iter_mut().zip(&self.poly_pressure) {
            *dst = src.load(Ordering::Relaxed);
        }
        controllers.channel_pressure = self.channel_pressure.load(Ordering::Relaxed);
        controllers.pitch_bend = self.pitch_bend.load() as f64;
        controllers.bend_sensitivity = self.bend_sensitivity.load() as f64;
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        let mut snapshot = ControlSnapshot::default();
        self.refresh(&mut snapshot);
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_slots_cover_preview_and_midi_keys() {
        assert_eq!(key_slot(-2), Some(0));
        assert_eq!(key_slot(-1), Some(1));
        assert_eq!(key_slot(127), Some(129));
        assert_eq!(key_slot(128), None);
        assert_eq!(key_slot(-3), None);
    }

    #[test]
    fn release_generation_only_affects_its_key() {
        let controls = EngineControls::new();
        let before = controls.snapshot();
        let (gen60, _) = before.generations_for(60);
        let (gen61, _) = before.generations_for(61);

        controls.release_key(60);
        let after = controls.snapshot();
        assert!(after.is_key_released(60, gen60));
        assert!(!after.is_key_released(61, gen61));
        // A voice born after the release is not affected by it.
        let (reborn, _) = after.generations_for(60);
        assert!(!after.is_key_released(60, reborn));
    }

    #[test]
    fn gain_is_linear_in_snapshot() {
        let controls = EngineControls::new();
        controls.set_gain(-20.0);
        controls.set_sample_gain(6.0);
        let snap = controls.snapshot();
        assert!((snap.gain - 0.1).abs() < 1e-6);
        assert!((snap.sample_gain - 1.995).abs() < 1e-3);
    }

    #[test]
    fn preview_overrides_respect_linked_flag() {
        let controls = EngineControls::new();
        controls.set_start_loop(100, false);
        controls.set_pitch_correction(-12, true);
        let snap = controls.snapshot();
        assert_eq!(snap.preview.start_loop.for_key(-1), Some(100));
        assert_eq!(snap.preview.start_loop.for_key(-2), None);
        assert_eq!(snap.preview.pitch_correction.for_key(-2), Some(-12));
        assert_eq!(snap.preview.end_loop.for_key(-1), None);
        assert_eq!(snap.preview.start_loop.for_key(60), None);

        controls.clear_preview_overrides();
        let snap = controls.snapshot();
        assert_eq!(snap.preview.start_loop.for_key(-1), None);
        assert_eq!(snap.preview.pitch_correction.for_key(-1), None);
    }

    #[test]
    fn midi_controllers_are_clamped() {
        let controls = EngineControls::new();
        controls.set_controller(1, 200);
        controls.set_pitch_bend(3.0);
        controls.set_poly_pressure(60, 90);
        let snap = controls.snapshot();
        assert_eq!(snap.controllers.cc[1], 127);
        assert_eq!(snap.controllers.cc[7], 100);
        assert_eq!(snap.controllers.pitch_bend, 1.0);
        assert_eq!(snap.controllers.poly_pressure[60], 90);
    }
}
