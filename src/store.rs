//! Attribute store — the hierarchical instrument description the synth reads.
//!
//! A soundfont holds presets, instruments and samples. Presets link to
//! instruments and instruments link to samples through divisions, each of
//! which carries generators (typed attributes) and modulators. The synth only
//! ever reads this tree through [`AttributeStore`]; [`MemoryStore`] is a
//! thread-safe in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

// ── Element identifiers ─────────────────────────────────────

/// Type tag of an element in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementKind {
    Soundfont,
    Preset,
    Instrument,
    Sample,
    /// A division of an instrument pointing at a sample.
    InstrumentSample,
    /// A division of a preset pointing at an instrument.
    PresetInstrument,
}

/// Typed reference into the store. Never owns data.
///
/// `element` is the preset / instrument / sample index inside soundfont
/// `sf2`; `link` is the division index for the two link kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementId {
    pub kind: ElementKind,
    pub sf2: i32,
    pub element: i32,
    #[serde(default)]
    pub link: i32,
}

impl ElementId {
    pub const fn new(kind: ElementKind, sf2: i32, element: i32, link: i32) -> Self {
        ElementId {
            kind,
            sf2,
            element,
            link,
        }
    }

    pub const fn soundfont(sf2: i32) -> Self {
        Self::new(ElementKind::Soundfont, sf2, 0, 0)
    }

    pub const fn preset(sf2: i32, preset: i32) -> Self {
        Self::new(ElementKind::Preset, sf2, preset, 0)
    }

    pub const fn instrument(sf2: i32, instrument: i32) -> Self {
        Self::new(ElementKind::Instrument, sf2, instrument, 0)
    }

    pub const fn sample(sf2: i32, sample: i32) -> Self {
        Self::new(ElementKind::Sample, sf2, sample, 0)
    }

    pub const fn instrument_sample(sf2: i32, instrument: i32, link: i32) -> Self {
        Self::new(ElementKind::InstrumentSample, sf2, instrument, link)
    }

    pub const fn preset_instrument(sf2: i32, preset: i32, link: i32) -> Self {
        Self::new(ElementKind::PresetInstrument, sf2, preset, link)
    }

    /// The element whose global division holds the defaults for this one.
    /// Links resolve to their owning preset / instrument; others to themselves.
    pub fn parent(&self) -> ElementId {
        match self.kind {
            ElementKind::InstrumentSample => Self::instrument(self.sf2, self.element),
            ElementKind::PresetInstrument => Self::preset(self.sf2, self.element),
            _ => *self,
        }
    }

    pub fn with_link(self, link: i32) -> ElementId {
        ElementId { link, ..self }
    }
}

// ── Attributes ──────────────────────────────────────────────

/// Number of generator slots in a voice parameter bank.
pub const GENERATOR_COUNT: usize = 61;

/// A typed attribute. Discriminants `0..GENERATOR_COUNT` are the generator
/// numbers of the soundfont format; the rest are element properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum AttributeType {
    StartAddrsOffset = 0,
    EndAddrsOffset = 1,
    StartLoopAddrsOffset = 2,
    EndLoopAddrsOffset = 3,
    StartAddrsCoarseOffset = 4,
    ModLfoToPitch = 5,
    VibLfoToPitch = 6,
    ModEnvToPitch = 7,
    InitialFilterFc = 8,
    InitialFilterQ = 9,
    ModLfoToFilterFc = 10,
    ModEnvToFilterFc = 11,
    EndAddrsCoarseOffset = 12,
    ModLfoToVolume = 13,
    Unused1 = 14,
    ChorusEffectsSend = 15,
    ReverbEffectsSend = 16,
    Pan = 17,
    Unused2 = 18,
    Unused3 = 19,
    Unused4 = 20,
    DelayModLfo = 21,
    FreqModLfo = 22,
    DelayVibLfo = 23,
    FreqVibLfo = 24,
    DelayModEnv = 25,
    AttackModEnv = 26,
    HoldModEnv = 27,
    DecayModEnv = 28,
    SustainModEnv = 29,
    ReleaseModEnv = 30,
    KeynumToModEnvHold = 31,
    KeynumToModEnvDecay = 32,
    DelayVolEnv = 33,
    AttackVolEnv = 34,
    HoldVolEnv = 35,
    DecayVolEnv = 36,
    SustainVolEnv = 37,
    ReleaseVolEnv = 38,
    KeynumToVolEnvHold = 39,
    KeynumToVolEnvDecay = 40,
    Instrument = 41,
    Reserved1 = 42,
    KeyRange = 43,
    VelRange = 44,
    StartLoopAddrsCoarseOffset = 45,
    Keynum = 46,
    Velocity = 47,
    InitialAttenuation = 48,
    Reserved2 = 49,
    EndLoopAddrsCoarseOffset = 50,
    CoarseTune = 51,
    FineTune = 52,
    SampleId = 53,
    SampleModes = 54,
    Reserved3 = 55,
    ScaleTuning = 56,
    ExclusiveClass = 57,
    OverridingRootKey = 58,
    Unused5 = 59,
    EndOper = 60,

    /// Division is muted (skipped when resolving a note).
    Mute = 100,
    SampleLength = 101,
    SampleStartLoop = 102,
    SampleEndLoop = 103,
    SampleRate = 104,
    /// Root key the sample was recorded at.
    SampleOriginalPitch = 105,
    /// Pitch correction in cents.
    SamplePitchCorrection = 106,
    SampleType = 107,
    /// Index of the stereo-linked sample.
    SampleLinkedIndex = 108,
}

use AttributeType as A;

const GENERATORS: [AttributeType; GENERATOR_COUNT] = [
    A::StartAddrsOffset,
    A::EndAddrsOffset,
    A::StartLoopAddrsOffset,
    A::EndLoopAddrsOffset,
    A::StartAddrsCoarseOffset,
    A::ModLfoToPitch,
    A::VibLfoToPitch,
    A::ModEnvToPitch,
    A::InitialFilterFc,
    A::InitialFilterQ,
    A::ModLfoToFilterFc,
    A::ModEnvToFilterFc,
    A::EndAddrsCoarseOffset,
    A::ModLfoToVolume,
    A::Unused1,
    A::ChorusEffectsSend,
    A::ReverbEffectsSend,
    A::Pan,
    A::Unused2,
    A::Unused3,
    A::Unused4,
    A::DelayModLfo,
    A::FreqModLfo,
    A::DelayVibLfo,
    A::FreqVibLfo,
    A::DelayModEnv,
    A::AttackModEnv,
    A::HoldModEnv,
    A::DecayModEnv,
    A::SustainModEnv,
    A::ReleaseModEnv,
    A::KeynumToModEnvHold,
    A::KeynumToModEnvDecay,
    A::DelayVolEnv,
    A::AttackVolEnv,
    A::HoldVolEnv,
    A::DecayVolEnv,
    A::SustainVolEnv,
    A::ReleaseVolEnv,
    A::KeynumToVolEnvHold,
    A::KeynumToVolEnvDecay,
    A::Instrument,
    A::Reserved1,
    A::KeyRange,
    A::VelRange,
    A::StartLoopAddrsCoarseOffset,
    A::Keynum,
    A::Velocity,
    A::InitialAttenuation,
    A::Reserved2,
    A::EndLoopAddrsCoarseOffset,
    A::CoarseTune,
    A::FineTune,
    A::SampleId,
    A::SampleModes,
    A::Reserved3,
    A::ScaleTuning,
    A::ExclusiveClass,
    A::OverridingRootKey,
    A::Unused5,
    A::EndOper,
];

impl AttributeType {
    /// Look up a generator by its number.
    pub fn generator(number: u16) -> Option<AttributeType> {
        GENERATORS.get(number as usize).copied()
    }

    /// All generators in slot order.
    pub fn generators() -> impl Iterator<Item = AttributeType> {
        GENERATORS.iter().copied()
    }

    pub fn is_generator(self) -> bool {
        (self as u16 as usize) < GENERATOR_COUNT
    }

    /// Slot of a generator in a parameter bank.
    pub fn slot(self) -> Option<usize> {
        let n = self as u16 as usize;
        (n < GENERATOR_COUNT).then_some(n)
    }

    /// Value used when no division sets this attribute.
    pub fn default_value(self) -> i32 {
        match self {
            A::InitialFilterFc => 13500,
            A::DelayModLfo | A::DelayVibLfo => -12000,
            A::DelayModEnv
            | A::AttackModEnv
            | A::HoldModEnv
            | A::DecayModEnv
            | A::ReleaseModEnv
            | A::DelayVolEnv
            | A::AttackVolEnv
            | A::HoldVolEnv
            | A::DecayVolEnv
            | A::ReleaseVolEnv => -12000,
            A::Keynum | A::Velocity | A::OverridingRootKey => -1,
            A::ScaleTuning => 100,
            A::SampleOriginalPitch => 60,
            A::SampleRate => 44100,
            A::SampleType => SampleLink::Mono as i32,
            _ => 0,
        }
    }

    /// Generators that are absolute at instrument level and ignored in
    /// preset divisions.
    pub fn is_instrument_only(self) -> bool {
        matches!(
            self,
            A::StartAddrsOffset
                | A::EndAddrsOffset
                | A::StartLoopAddrsOffset
                | A::EndLoopAddrsOffset
                | A::StartAddrsCoarseOffset
                | A::EndAddrsCoarseOffset
                | A::StartLoopAddrsCoarseOffset
                | A::EndLoopAddrsCoarseOffset
                | A::Keynum
                | A::Velocity
                | A::SampleModes
                | A::ExclusiveClass
                | A::OverridingRootKey
        )
    }

    /// Attributes that never take part in parameter summation.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            A::Instrument
                | A::SampleId
                | A::KeyRange
                | A::VelRange
                | A::Unused1
                | A::Unused2
                | A::Unused3
                | A::Unused4
                | A::Unused5
                | A::Reserved1
                | A::Reserved2
                | A::Reserved3
                | A::EndOper
        ) || !self.is_generator()
    }
}

/// Key or velocity range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeValue {
    pub low: u8,
    pub high: u8,
}

impl RangeValue {
    pub const FULL: RangeValue = RangeValue { low: 0, high: 127 };

    pub fn new(low: u8, high: u8) -> Self {
        RangeValue { low, high }
    }

    pub fn contains(&self, value: i32) -> bool {
        value >= self.low as i32 && value <= self.high as i32
    }
}

/// Sample channel role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum SampleLink {
    Mono = 1,
    Right = 2,
    Left = 4,
    Linked = 8,
    RomMono = 0x8001,
    RomRight = 0x8002,
    RomLeft = 0x8004,
    RomLinked = 0x8008,
}

impl SampleLink {
    pub fn from_i32(value: i32) -> SampleLink {
        match value {
            2 => SampleLink::Right,
            4 => SampleLink::Left,
            8 => SampleLink::Linked,
            0x8001 => SampleLink::RomMono,
            0x8002 => SampleLink::RomRight,
            0x8004 => SampleLink::RomLeft,
            0x8008 => SampleLink::RomLinked,
            _ => SampleLink::Mono,
        }
    }

    /// Has a stereo counterpart.
    pub fn is_stereo(self) -> bool {
        !matches!(self, SampleLink::Mono | SampleLink::RomMono)
    }

    pub fn is_left(self) -> bool {
        matches!(self, SampleLink::Left | SampleLink::RomLeft)
    }

    pub fn is_right(self) -> bool {
        matches!(self, SampleLink::Right | SampleLink::RomRight)
    }
}

/// Value of a typed attribute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeValue {
    Value(i32),
    Range(RangeValue),
    Link(SampleLink),
}

impl AttributeValue {
    pub fn as_i32(&self) -> i32 {
        match self {
            AttributeValue::Value(v) => *v,
            AttributeValue::Range(r) => r.low as i32 | ((r.high as i32) << 8),
            AttributeValue::Link(l) => *l as i32,
        }
    }

    pub fn as_range(&self) -> RangeValue {
        match self {
            AttributeValue::Range(r) => *r,
            _ => RangeValue::FULL,
        }
    }

    pub fn as_bool(&self) -> bool {
        self.as_i32() != 0
    }

    pub fn as_link(&self) -> SampleLink {
        match self {
            AttributeValue::Link(l) => *l,
            other => SampleLink::from_i32(other.as_i32()),
        }
    }

    /// Default value of an unset attribute.
    pub fn default_for(attribute: AttributeType) -> AttributeValue {
        match attribute {
            A::KeyRange | A::VelRange => AttributeValue::Range(RangeValue::FULL),
            A::SampleType => AttributeValue::Link(SampleLink::Mono),
            other => AttributeValue::Value(other.default_value()),
        }
    }
}

// ── Modulator definitions ───────────────────────────────────

/// Destinations at or above this value address another modulator.
pub const LINK_TARGET_BASE: u16 = 32768;

/// Source transform curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveType {
    Linear,
    Concave,
    Convex,
    Switch,
}

/// Controllers available when the CC flag of a source is clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneralController {
    NoController,
    NoteOnVelocity,
    NoteOnKey,
    PolyPressure,
    ChannelPressure,
    PitchWheel,
    PitchWheelSensitivity,
    /// Output of other modulators linked to this one.
    Link,
}

impl GeneralController {
    pub fn index(self) -> u8 {
        match self {
            GeneralController::NoController => 0,
            GeneralController::NoteOnVelocity => 2,
            GeneralController::NoteOnKey => 3,
            GeneralController::PolyPressure => 10,
            GeneralController::ChannelPressure => 13,
            GeneralController::PitchWheel => 14,
            GeneralController::PitchWheelSensitivity => 16,
            GeneralController::Link => 127,
        }
    }

    pub fn from_index(index: u8) -> Option<GeneralController> {
        Some(match index {
            0 => GeneralController::NoController,
            2 => GeneralController::NoteOnVelocity,
            3 => GeneralController::NoteOnKey,
            10 => GeneralController::PolyPressure,
            13 => GeneralController::ChannelPressure,
            14 => GeneralController::PitchWheel,
            16 => GeneralController::PitchWheelSensitivity,
            127 => GeneralController::Link,
            _ => return None,
        })
    }
}

/// Packed modulator source: controller index, CC flag, direction, polarity
/// and curve, laid out as in the soundfont format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceOperator(pub u16);

impl SourceOperator {
    pub const NONE: SourceOperator = SourceOperator(0);

    pub fn general(controller: GeneralController, descending: bool, bipolar: bool, curve: CurveType) -> Self {
        Self::pack(controller.index(), false, descending, bipolar, curve)
    }

    pub fn midi_cc(cc: u8, descending: bool, bipolar: bool, curve: CurveType) -> Self {
        Self::pack(cc, true, descending, bipolar, curve)
    }

    fn pack(index: u8, cc: bool, descending: bool, bipolar: bool, curve: CurveType) -> Self {
        let curve_bits: u16 = match curve {
            CurveType::Linear => 0,
            CurveType::Concave => 1,
            CurveType::Convex => 2,
            CurveType::Switch => 3,
        };
        SourceOperator(
            (index as u16 & 0x7F)
                | ((cc as u16) << 7)
                | ((descending as u16) << 8)
                | ((bipolar as u16) << 9)
                | (curve_bits << 10),
        )
    }

    pub fn index(self) -> u8 {
        (self.0 & 0x7F) as u8
    }

    pub fn is_cc(self) -> bool {
        self.0 & 0x80 != 0
    }

    pub fn is_descending(self) -> bool {
        self.0 & 0x100 != 0
    }

    pub fn is_bipolar(self) -> bool {
        self.0 & 0x200 != 0
    }

    pub fn curve(self) -> CurveType {
        match (self.0 >> 10) & 0x3F {
            1 => CurveType::Concave,
            2 => CurveType::Convex,
            3 => CurveType::Switch,
            _ => CurveType::Linear,
        }
    }

    /// The general controller, if the CC flag is clear.
    pub fn controller(self) -> Option<GeneralController> {
        if self.is_cc() {
            None
        } else {
            GeneralController::from_index(self.index())
        }
    }
}

/// Output transform applied after scaling.
pub const TRANSFORM_LINEAR: u16 = 0;
pub const TRANSFORM_ABSOLUTE: u16 = 2;

/// One modulator definition as stored in a division.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulatorData {
    pub source: SourceOperator,
    /// Generator number, or `LINK_TARGET_BASE + index` of another modulator.
    pub destination: u16,
    pub amount: i16,
    #[serde(default)]
    pub amount_source: SourceOperator,
    #[serde(default)]
    pub transform: u16,
    /// Position of this modulator in its division.
    #[serde(default)]
    pub index: u16,
}

impl ModulatorData {
    pub fn new(source: SourceOperator, destination: AttributeType, amount: i16) -> Self {
        ModulatorData {
            source,
            destination: destination as u16,
            amount,
            amount_source: SourceOperator::NONE,
            transform: TRANSFORM_LINEAR,
            index: 0,
        }
    }

    /// Modulator whose output feeds modulator `index` of the same division.
    pub fn linked(source: SourceOperator, index: u16, amount: i16) -> Self {
        ModulatorData {
            source,
            destination: LINK_TARGET_BASE + index,
            amount,
            amount_source: SourceOperator::NONE,
            transform: TRANSFORM_LINEAR,
            index: 0,
        }
    }

    pub fn with_amount_source(mut self, amount_source: SourceOperator) -> Self {
        self.amount_source = amount_source;
        self
    }

    pub fn with_index(mut self, index: u16) -> Self {
        self.index = index;
        self
    }

    /// Index of the target modulator for linked modulators.
    pub fn target_modulator(&self) -> Option<u16> {
        (self.destination >= LINK_TARGET_BASE).then(|| self.destination - LINK_TARGET_BASE)
    }

    /// Two definitions are the same modulator when their sources,
    /// destination and transform match. Linked modulators never merge.
    pub fn same_identity(&self, other: &ModulatorData) -> bool {
        self.target_modulator().is_none()
            && self.source == other.source
            && self.destination == other.destination
            && self.amount_source == other.amount_source
            && self.transform == other.transform
    }
}

// ── Store contract ──────────────────────────────────────────

/// Read/write access to the instrument description, keyed by element id.
pub trait AttributeStore: Send + Sync {
    fn is_valid(&self, id: ElementId) -> bool;

    fn is_set(&self, id: ElementId, attribute: AttributeType) -> bool;

    /// Attribute value, or its default when unset.
    fn get(&self, id: ElementId, attribute: AttributeType) -> AttributeValue;

    fn set(&self, id: ElementId, attribute: AttributeType, value: AttributeValue) -> Result<(), StoreError>;

    /// Link indices of all divisions sharing `id`'s parent, in order.
    fn siblings(&self, id: ElementId) -> Vec<i32>;

    /// Modulators defined on a division (preset, instrument or link).
    fn modulators(&self, id: ElementId) -> Vec<ModulatorData>;

    /// Raw PCM of a sample, normalized to [-1, 1].
    fn sample_data(&self, id: ElementId) -> Option<Arc<[f32]>>;
}

#[derive(Debug, Default)]
struct ElementData {
    attributes: HashMap<AttributeType, AttributeValue>,
    modulators: Vec<ModulatorData>,
    sample: Option<Arc<[f32]>>,
}

/// In-memory attribute store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    elements: RwLock<HashMap<ElementId, ElementData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty element.
    pub fn add(&self, id: ElementId) {
        self.elements.write().entry(id).or_default();
    }

    /// Register a mono sample with its PCM data.
    pub fn add_sample(&self, sf2: i32, index: i32, data: Vec<f32>, sample_rate: u32, root_key: u8) -> ElementId {
        let id = ElementId::sample(sf2, index);
        let len = data.len() as i32;
        let mut elements = self.elements.write();
        let element = elements.entry(id).or_default();
        element.sample = Some(Arc::from(data));
        let attrs = &mut element.attributes;
        attrs.insert(A::SampleLength, AttributeValue::Value(len));
        attrs.insert(A::SampleRate, AttributeValue::Value(sample_rate as i32));
        attrs.insert(A::SampleOriginalPitch, AttributeValue::Value(root_key as i32));
        attrs.insert(A::SampleType, AttributeValue::Link(SampleLink::Mono));
        id
    }

    pub fn add_instrument(&self, sf2: i32, index: i32) -> ElementId {
        let id = ElementId::instrument(sf2, index);
        self.add(id);
        id
    }

    pub fn add_preset(&self, sf2: i32, index: i32) -> ElementId {
        let id = ElementId::preset(sf2, index);
        self.add(id);
        id
    }

    /// Add a division to `instrument` pointing at `sample`.
    pub fn link_sample(&self, instrument: ElementId, sample: ElementId) -> ElementId {
        let link = self.next_link(ElementId::instrument_sample(instrument.sf2, instrument.element, 0));
        let mut elements = self.elements.write();
        elements
            .entry(link)
            .or_default()
            .attributes
            .insert(A::SampleId, AttributeValue::Value(sample.element));
        link
    }

    /// Add a division to `preset` pointing at `instrument`.
    pub fn link_instrument(&self, preset: ElementId, instrument: ElementId) -> ElementId {
        let link = self.next_link(ElementId::preset_instrument(preset.sf2, preset.element, 0));
        let mut elements = self.elements.write();
        elements
            .entry(link)
            .or_default()
            .attributes
            .insert(A::Instrument, AttributeValue::Value(instrument.element));
        link
    }

    pub fn set_modulators(&self, id: ElementId, modulators: Vec<ModulatorData>) -> Result<(), StoreError> {
        let mut elements = self.elements.write();
        let element = elements.get_mut(&id).ok_or(StoreError::InvalidElement { id })?;
        element.modulators = modulators;
        Ok(())
    }

    /// Convenience setter for plain integer attributes.
    pub fn set_value(&self, id: ElementId, attribute: AttributeType, value: i32) -> Result<(), StoreError> {
        self.set(id, attribute, AttributeValue::Value(value))
    }

    fn next_link(&self, first: ElementId) -> ElementId {
        let next = self.siblings(first).last().map_or(0, |last| last + 1);
        first.with_link(next)
    }
}

impl AttributeStore for MemoryStore {
    fn is_valid(&self, id: ElementId) -> bool {
        self.elements.read().contains_key(&id)
    }

    fn is_set(&self, id: ElementId, attribute: AttributeType) -> bool {
        self.elements
            .read()
            .get(&id)
            .is_some_and(|e| e.attributes.contains_key(&attribute))
    }

    fn get(&self, id: ElementId, attribute: AttributeType) -> AttributeValue {
        self.elements
            .read()
            .get(&id)
            .and_then(|e| e.attributes.get(&attribute).copied())
            .unwrap_or_else(|| AttributeValue::default_for(attribute))
    }

    fn set(&self, id: ElementId, attribute: AttributeType, value: AttributeValue) -> Result<(), StoreError> {
        let mut elements = self.elements.write();
        let element = elements.get_mut(&id).ok_or(StoreError::InvalidElement { id })?;
        let sample_attribute = !attribute.is_generator() && attribute != A::Mute;
        if sample_attribute != (id.kind == ElementKind::Sample) {
            return Err(StoreError::InvalidAttribute { id, attribute });
        }
        element.attributes.insert(attribute, value);
        Ok(())
    }

    fn siblings(&self, id: ElementId) -> Vec<i32> {
        let mut links: Vec<i32> = self
            .elements
            .read()
            .keys()
            .filter(|k| k.kind == id.kind && k.sf2 == id.sf2 && k.element == id.element)
            .map(|k| k.link)
            .collect();
        links.sort_unstable();
        links
    }

    fn modulators(&self, id: ElementId) -> Vec<ModulatorData> {
        self.elements
            .read()
            .get(&id)
            .map(|e| e.modulators.clone())
            .unwrap_or_default()
    }

    fn sample_data(&self, id: ElementId) -> Option<Arc<[f32]>> {
        self.elements.read().get(&id).and_then(|e| e.sample.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_lookup_matches_discriminant() {
        for (i, generator) in AttributeType::generators().enumerate() {
            assert_eq!(generator as u16 as usize, i);
            assert_eq!(AttributeType::generator(i as u16), Some(generator));
        }
        assert_eq!(AttributeType::generator(61), None);
        assert!(!AttributeType::Mute.is_generator());
    }

    #[test]
    fn source_operator_packing() {
        let src = SourceOperator::general(GeneralController::NoteOnVelocity, true, false, CurveType::Concave);
        assert_eq!(src.0, 0x0502);
        assert_eq!(src.controller(), Some(GeneralController::NoteOnVelocity));
        assert!(src.is_descending());
        assert!(!src.is_bipolar());
        assert_eq!(src.curve(), CurveType::Concave);

        let cc = SourceOperator::midi_cc(10, false, true, CurveType::Linear);
        assert!(cc.is_cc());
        assert_eq!(cc.index(), 10);
        assert_eq!(cc.controller(), None);
        assert!(cc.is_bipolar());
    }

    #[test]
    fn unset_attributes_return_defaults() {
        let store = MemoryStore::new();
        let inst = store.add_instrument(0, 0);
        assert!(!store.is_set(inst, AttributeType::KeyRange));
        assert_eq!(store.get(inst, AttributeType::KeyRange).as_range(), RangeValue::FULL);
        assert_eq!(store.get(inst, AttributeType::InitialFilterFc).as_i32(), 13500);
        assert_eq!(store.get(inst, AttributeType::ScaleTuning).as_i32(), 100);
    }

    #[test]
    fn links_are_numbered_in_order() {
        let store = MemoryStore::new();
        let smpl = store.add_sample(0, 0, vec![0.0; 10], 44100, 60);
        let inst = store.add_instrument(0, 0);
        let a = store.link_sample(inst, smpl);
        let b = store.link_sample(inst, smpl);
        assert_eq!(a.link, 0);
        assert_eq!(b.link, 1);
        assert_eq!(store.siblings(a), vec![0, 1]);
        assert_eq!(b.parent(), inst);
        assert_eq!(store.get(b, AttributeType::SampleId).as_i32(), 0);
    }

    #[test]
    fn sample_attributes_rejected_on_divisions() {
        let store = MemoryStore::new();
        let inst = store.add_instrument(0, 0);
        assert!(store.set_value(inst, AttributeType::SampleRate, 22050).is_err());
        assert!(store.set_value(inst, AttributeType::Pan, 100).is_ok());
        let missing = ElementId::instrument(0, 9);
        assert!(store.set_value(missing, AttributeType::Pan, 0).is_err());
    }

    #[test]
    fn modulator_identity_ignores_amount() {
        let src = SourceOperator::midi_cc(1, false, false, CurveType::Linear);
        let a = ModulatorData::new(src, AttributeType::VibLfoToPitch, 50);
        let b = ModulatorData::new(src, AttributeType::VibLfoToPitch, 100);
        let c = ModulatorData::new(src, AttributeType::ModLfoToPitch, 50);
        assert!(a.same_identity(&b));
        assert!(!a.same_identity(&c));
        let link = ModulatorData::linked(src, 0, 10);
        assert!(!link.same_identity(&link));
    }
}
