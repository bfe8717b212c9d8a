//! Synth — voice creation, engine partitioning and the master effects chain.
//!
//! The control domain calls [`Synth::play`] and the configuration setters;
//! the audio device pulls buffers with [`Synth::read_data`]. Engines,
//! reverb, master chain and recorder each sit behind their own lock, always
//! taken in that order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{AudioFormat, SynthConfig, parse_temperament};
use crate::controls::{ControlSnapshot, EngineControls};
use crate::dsp::chorus::{Chorus, ChorusSettings};
use crate::dsp::equalizer::Equalizer;
use crate::dsp::limiter::ClipLimiter;
use crate::dsp::oscillator::CalibrationSinus;
use crate::dsp::reverb::{Reverb, ReverbSettings};
use crate::dsp::sample::SampleBuffer;
use crate::dsp::voice::Voice;
use crate::dsp::voice_param::{DivisionChain, VoiceParam};
use crate::error::SynthError;
use crate::recorder::WavRecorder;
use crate::sound_engine::{ChokeRequest, SoundEngine, VoiceInfo};
use crate::store::{AttributeStore, AttributeType as A, ElementId, ElementKind, RangeValue};

/// Capacity of the event channel. Events beyond it are dropped.
pub const EVENT_CAPACITY: usize = 256;

/// Notifications for the control domain, polled through [`Synth::events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthEvent {
    /// Playback position of the sample preview voice, once per tick.
    Position { token: i32, position: u32 },
    /// A voice finished and was removed from its engine.
    VoiceFinished { token: i32 },
    /// A buffer was appended to the record file.
    DataWritten { sample_rate: u32, frames: usize },
}

// ── Locked state ────────────────────────────────────────────

/// The render partitions and the reverb-send scratch buffers.
struct EngineSet {
    engines: Vec<SoundEngine>,
    buffer_size: usize,
    send_left: Vec<f32>,
    send_right: Vec<f32>,
}

impl EngineSet {
    fn spawn(
        count: usize,
        buffer_size: usize,
        controls: &Arc<EngineControls>,
        events: &Sender<SynthEvent>,
    ) -> Result<Self, SynthError> {
        let engines = (0..count)
            .map(|i| SoundEngine::spawn(i, buffer_size, Arc::clone(controls), events.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        info!(engines = count, buffer_size, "render engines created");
        Ok(EngineSet {
            engines,
            buffer_size,
            send_left: vec![0.0; buffer_size],
            send_right: vec![0.0; buffer_size],
        })
    }

    /// Render one chunk of at most `buffer_size` frames from every engine,
    /// leaving the reverb sends in the scratch buffers.
    fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        let n = left.len();
        let send_left = &mut self.send_left[..n];
        let send_right = &mut self.send_right[..n];
        send_left.fill(0.0);
        send_right.fill(0.0);
        for engine in &mut self.engines {
            engine.request_render(n);
        }
        for engine in &mut self.engines {
            engine.add_data(left, right, send_left, send_right);
        }
    }

    /// Engine with the fewest voices.
    fn least_busy(&self) -> Option<&SoundEngine> {
        self.engines.iter().min_by_key(|e| e.voice_count())
    }
}

struct MasterChain {
    equalizer: Equalizer,
    sinus: CalibrationSinus,
    limiter: ClipLimiter,
}

impl MasterChain {
    fn new(sample_rate: f64) -> Self {
        MasterChain {
            equalizer: Equalizer::new(sample_rate),
            sinus: CalibrationSinus::new(sample_rate),
            limiter: ClipLimiter::new(sample_rate),
        }
    }
}

#[derive(Default)]
struct RecordState {
    active: Option<WavRecorder>,
    paused: bool,
    /// Write failure that stopped the last recording.
    failure: Option<std::io::Error>,
}

#[derive(Debug, Clone)]
struct Settings {
    config: SynthConfig,
    format: AudioFormat,
}

impl Settings {
    fn chorus(&self) -> ChorusSettings {
        ChorusSettings {
            level: self.config.chorus_level,
            depth: self.config.chorus_depth,
            frequency: self.config.chorus_frequency,
        }
    }
}

/// What every voice of one `play` call is built with.
struct PlayContext {
    sample_rate: u32,
    chorus: ChorusSettings,
    vel_to_filter: bool,
    snapshot: ControlSnapshot,
}

// ── Synth ───────────────────────────────────────────────────

pub struct Synth {
    store: Arc<dyn AttributeStore>,
    controls: Arc<EngineControls>,
    engines: Mutex<EngineSet>,
    reverb: Mutex<Reverb>,
    master: Mutex<MasterChain>,
    recorder: Mutex<RecordState>,
    settings: Mutex<Settings>,
    next_token: AtomicI32,
    event_tx: Sender<SynthEvent>,
    event_rx: Receiver<SynthEvent>,
}

impl Synth {
    /// Create a synth reading its instruments from `store`, at the default
    /// audio format.
    pub fn new(store: Arc<dyn AttributeStore>, config: SynthConfig) -> Result<Self, SynthError> {
        config.validate()?;
        let format = AudioFormat::default();
        let rate = format.sample_rate as f64;
        let controls = Arc::new(EngineControls::new());
        let (event_tx, event_rx) = bounded(EVENT_CAPACITY);
        let engines = EngineSet::spawn(config.resolved_engine_count(), config.buffer_size, &controls, &event_tx)?;

        let synth = Synth {
            store,
            controls,
            engines: Mutex::new(engines),
            reverb: Mutex::new(Reverb::new(rate)),
            master: Mutex::new(MasterChain::new(rate)),
            recorder: Mutex::new(RecordState::default()),
            settings: Mutex::new(Settings {
                config: config.clone(),
                format,
            }),
            next_token: AtomicI32::new(0),
            event_tx,
            event_rx,
        };
        synth.apply_shared_settings(&config);
        Ok(synth)
    }

    // ── Triggering ──

    /// Start the voices of `id` on `key`. Returns the token of the first
    /// voice, or `None` for a key-off or when nothing could be played.
    ///
    /// Keys -1 and -2 are the sample preview and its stereo-linked voice;
    /// they ignore key and velocity ranges and exclusive classes.
    pub fn play(&self, id: ElementId, key: i32, velocity: i32) -> Option<i32> {
        if velocity == 0 {
            self.controls.release_key(key);
            return None;
        }
        if !self.store.is_valid(id) {
            debug!(?id, "play: unknown element");
            return None;
        }
        if key < 0 {
            // A new preview replaces the previous one.
            self.controls.release_key(-1);
            self.controls.release_key(-2);
            if key == -1 {
                self.controls.clear_preview_overrides();
            }
        }

        let ctx = self.play_context();
        let mut voices = Vec::new();
        // A division plays through its owner so that ranges and mute apply.
        match id.kind {
            ElementKind::Sample => self.collect_sample(id, key, velocity, &ctx, &mut voices),
            ElementKind::Instrument | ElementKind::InstrumentSample => {
                self.collect_instrument(id.parent(), None, key, velocity, &ctx, &mut voices)
            }
            ElementKind::Preset | ElementKind::PresetInstrument => {
                let first = ElementId::preset_instrument(id.sf2, id.element, 0);
                for division in self.divisions(first, key, velocity) {
                    self.collect_preset_division(division, key, velocity, &ctx, &mut voices);
                }
            }
            ElementKind::Soundfont => {}
        }

        let first = voices.first().map(Voice::token);
        if first.is_none() {
            debug!(?id, key, velocity, "play: no matching division");
        }
        self.dispatch(voices, key);
        first
    }

    fn play_context(&self) -> PlayContext {
        let settings = self.settings.lock();
        PlayContext {
            sample_rate: settings.format.sample_rate,
            chorus: settings.chorus(),
            vel_to_filter: settings.config.vel_to_filter,
            snapshot: self.controls.snapshot(),
        }
    }

    /// Link indices of the divisions under `first`'s parent whose ranges
    /// accept `key` and `velocity`. Muted divisions are skipped.
    fn divisions(&self, first: ElementId, key: i32, velocity: i32) -> Vec<ElementId> {
        self.store
            .siblings(first)
            .into_iter()
            .map(|link| first.with_link(link))
            .filter(|&division| {
                !self.store.get(division, A::Mute).as_bool()
                    && (key < 0
                        || (self.range(division, A::KeyRange).contains(key)
                            && self.range(division, A::VelRange).contains(velocity)))
            })
            .collect()
    }

    /// Range of a division, falling back to its global division, then to
    /// the full range.
    fn range(&self, division: ElementId, attribute: A) -> RangeValue {
        if self.store.is_set(division, attribute) {
            self.store.get(division, attribute).as_range()
        } else if self.store.is_set(division.parent(), attribute) {
            self.store.get(division.parent(), attribute).as_range()
        } else {
            RangeValue::FULL
        }
    }

    fn collect_preset_division(
        &self,
        division: ElementId,
        key: i32,
        velocity: i32,
        ctx: &PlayContext,
        out: &mut Vec<Voice>,
    ) {
        let instrument = ElementId::instrument(division.sf2, self.store.get(division, A::Instrument).as_i32());
        if self.store.is_valid(instrument) {
            self.collect_instrument(instrument, Some(division), key, velocity, ctx, out);
        }
    }

    fn collect_instrument(
        &self,
        instrument: ElementId,
        preset_division: Option<ElementId>,
        key: i32,
        velocity: i32,
        ctx: &PlayContext,
        out: &mut Vec<Voice>,
    ) {
        let first = ElementId::instrument_sample(instrument.sf2, instrument.element, 0);
        for division in self.divisions(first, key, velocity) {
            self.collect_division(division, preset_division, key, velocity, ctx, out);
        }
    }

    fn collect_division(
        &self,
        division: ElementId,
        preset_division: Option<ElementId>,
        key: i32,
        velocity: i32,
        ctx: &PlayContext,
        out: &mut Vec<Voice>,
    ) {
        let sample = ElementId::sample(division.sf2, self.store.get(division, A::SampleId).as_i32());
        if !self.store.is_valid(sample) {
            return;
        }
        let chain = DivisionChain {
            preset_division,
            instrument_division: Some(division),
            sample,
        };
        out.extend(self.build_voice(&chain, key, velocity, ctx));
    }

    /// A bare sample; on the preview key its stereo partner plays on -2.
    fn collect_sample(&self, sample: ElementId, key: i32, velocity: i32, ctx: &PlayContext, out: &mut Vec<Voice>) {
        let Some(voice) = self.build_voice(&DivisionChain::sample_only(sample), key, velocity, ctx) else {
            return;
        };
        out.push(voice);
        if key != -1 {
            return;
        }
        let link = self.store.get(sample, A::SampleType).as_link();
        if !link.is_stereo() {
            return;
        }
        let linked = ElementId::sample(sample.sf2, self.store.get(sample, A::SampleLinkedIndex).as_i32());
        if linked != sample && self.store.is_valid(linked) {
            out.extend(self.build_voice(&DivisionChain::sample_only(linked), -2, velocity, ctx));
        }
    }

    fn build_voice(&self, chain: &DivisionChain, key: i32, velocity: i32, ctx: &PlayContext) -> Option<Voice> {
        let data = self.store.sample_data(chain.sample)?;
        let mut param = VoiceParam::new(self.store.as_ref(), chain, 0, key, velocity, ctx.vel_to_filter);
        if key < 0 {
            param.prepare_for_sample(key, param.sample_link());
        }
        if !param.compute_modulations(&ctx.snapshot.controllers) {
            warn!(sample = ?chain.sample, key, "modulator graph did not converge, using partial values");
        }
        let chorus = if key >= 0 {
            Chorus::from_settings(ctx.sample_rate as f64, ctx.chorus)
        } else {
            None
        };
        let sample = SampleBuffer::new(data, param.sample_rate());
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        Some(Voice::new(
            token,
            param,
            sample,
            ctx.sample_rate,
            chorus,
            ctx.snapshot.generations_for(key),
        ))
    }

    /// Publish a batch of new voices: choke their exclusive classes first,
    /// then hand each voice to the least busy engine.
    fn dispatch(&self, voices: Vec<Voice>, key: i32) {
        if voices.is_empty() {
            return;
        }
        let set = self.engines.lock();
        if key >= 0 {
            let batch: Arc<[i32]> = voices.iter().map(Voice::token).collect();
            let mut choked: Vec<ChokeRequest> = Vec::new();
            for voice in voices.iter().filter(|v| v.exclusive_class() != 0) {
                let request = ChokeRequest {
                    exclusive_class: voice.exclusive_class(),
                    sf2_id: voice.sf2_id(),
                    preset_id: voice.preset_id(),
                    spared: Arc::clone(&batch),
                };
                if !choked.contains(&request) {
                    for engine in &set.engines {
                        engine.choke(request.clone());
                    }
                    choked.push(request);
                }
            }
        }
        for voice in voices {
            if let Some(engine) = set.least_busy() {
                engine.add_voice(voice);
            }
        }
    }

    // ── Rendering ──

    /// Fill `left` and `right` with the next block of the master mix.
    pub fn read_data(&self, left: &mut [f32], right: &mut [f32]) {
        let frames = left.len().min(right.len());
        let left = &mut left[..frames];
        let right = &mut right[..frames];
        left.fill(0.0);
        right.fill(0.0);

        {
            let mut set = self.engines.lock();
            let chunk = set.buffer_size.max(1);
            let mut offset = 0;
            while offset < frames {
                let n = chunk.min(frames - offset);
                let l = &mut left[offset..offset + n];
                let r = &mut right[offset..offset + n];
                set.render(l, r);
                self.master.lock().equalizer.filter_data(l, r);
                self.reverb
                    .lock()
                    .process_sends(&set.send_left[..n], &set.send_right[..n], l, r);
                offset += n;
            }
        }

        {
            let mut master = self.master.lock();
            master.sinus.add_data(left, right);
            master.limiter.process(left, right);
        }

        let mut record = self.recorder.lock();
        if record.paused {
            return;
        }
        let Some(recorder) = record.active.as_mut() else {
            return;
        };
        match recorder.write(left, right) {
            Ok(()) => {
                let sample_rate = recorder.sample_rate();
                let _ = self.event_tx.try_send(SynthEvent::DataWritten { sample_rate, frames });
            }
            Err(err) => {
                record.active = None;
                record.failure = Some(err);
            }
        }
    }

    // ── Configuration ──

    /// Apply a new configuration. Stops all voices; recreates the engines
    /// when the buffer size or engine count changes.
    pub fn update_configuration(&self, config: &SynthConfig) -> Result<(), SynthError> {
        config.validate()?;
        self.stop();
        self.apply_shared_settings(config);
        self.settings.lock().config = config.clone();

        let count = config.resolved_engine_count();
        let mut set = self.engines.lock();
        if set.buffer_size != config.buffer_size || set.engines.len() != count {
            for engine in &set.engines {
                engine.clear();
            }
            set.engines.clear();
            *set = EngineSet::spawn(count, config.buffer_size, &self.controls, &self.event_tx)?;
        }
        info!(gain = config.gain, tuning_fork = config.tuning_fork, "configuration updated");
        Ok(())
    }

    fn apply_shared_settings(&self, config: &SynthConfig) {
        let temperament = parse_temperament(&config.temperament).unwrap_or_else(|err| {
            warn!(%err, "invalid temperament, using equal temperament");
            [0.0; 12]
        });
        self.controls.set_gain(config.gain as f32);
        self.controls.set_tuning_fork(config.tuning_fork as f32);
        self.controls.set_temperament(&temperament);
        self.reverb.lock().apply(ReverbSettings {
            level: config.reverb_level,
            size: config.reverb_size,
            width: config.reverb_width,
            damping: config.reverb_damping,
        });
    }

    /// Set the output format. Stops all voices.
    pub fn set_format(&self, format: AudioFormat) {
        self.stop();
        let rate = format.sample_rate as f64;
        {
            let mut reverb = self.reverb.lock();
            *reverb = reverb.resampled(rate);
        }
        {
            let mut master = self.master.lock();
            master.equalizer.set_sample_rate(rate);
            master.sinus.set_sample_rate(rate);
            master.limiter.set_sample_rate(rate);
        }
        self.settings.lock().format = format;
        info!(sample_rate = format.sample_rate, channels = format.channels, "audio format set");
    }

    pub fn format(&self) -> AudioFormat {
        self.settings.lock().format
    }

    pub fn config(&self) -> SynthConfig {
        self.settings.lock().config.clone()
    }

    // ── Live controls ──

    /// Quickly release every voice.
    pub fn stop(&self) {
        self.controls.stop_all();
    }

    /// Calibration tone at the pitch of `root_key`.
    pub fn set_sinus(&self, on: bool, root_key: i32) {
        let mut master = self.master.lock();
        master.sinus.set_pitch(root_key);
        if on {
            master.sinus.on();
        } else {
            master.sinus.off();
        }
    }

    pub fn activate_sample_eq(&self, active: bool) {
        self.master.lock().equalizer.set_active(active);
    }

    /// Band gains in dB, lowest band first.
    pub fn set_sample_eq_values(&self, gains: &[f64; 10]) {
        self.master.lock().equalizer.set_values(gains);
    }

    pub fn set_stereo(&self, stereo: bool) {
        self.controls.set_stereo(stereo);
    }

    pub fn is_stereo(&self) -> bool {
        self.controls.is_stereo()
    }

    pub fn set_loop_enabled(&self, enabled: bool) {
        self.controls.set_loop_enabled(enabled);
    }

    /// Extra gain of the preview voices, dB.
    pub fn set_gain_sample(&self, db: i32) {
        self.controls.set_sample_gain(db as f32);
    }

    pub fn set_start_loop(&self, position: u32, with_linked: bool) {
        self.controls.set_start_loop(position, with_linked);
    }

    pub fn set_end_loop(&self, position: u32, with_linked: bool) {
        self.controls.set_end_loop(position, with_linked);
    }

    pub fn set_pitch_correction(&self, cents: i32, with_linked: bool) {
        self.controls.set_pitch_correction(cents, with_linked);
    }

    pub fn set_controller(&self, cc: u8, value: u8) {
        self.controls.set_controller(cc, value);
    }

    /// Pitch wheel position in [-1, 1].
    pub fn set_pitch_bend(&self, bend: f32) {
        self.controls.set_pitch_bend(bend);
    }

    pub fn set_bend_sensitivity(&self, semitones: f32) {
        self.controls.set_bend_sensitivity(semitones);
    }

    pub fn set_channel_pressure(&self, value: u8) {
        self.controls.set_channel_pressure(value);
    }

    pub fn set_poly_pressure(&self, key: u8, value: u8) {
        self.controls.set_poly_pressure(key, value);
    }

    // ── Recording ──

    /// Start recording the master mix to `path`, ending any recording in
    /// progress first. On failure recording stays disabled.
    pub fn start_new_record(&self, path: impl AsRef<Path>) -> Result<(), SynthError> {
        let path = path.as_ref();
        let previous = {
            let mut record = self.recorder.lock();
            record.paused = false;
            record.failure = None;
            record.active.take()
        };
        if let Some(previous) = previous {
            let previous_path = previous.path().to_path_buf();
            if let Err(err) = previous.finish() {
                warn!(path = %previous_path.display(), %err, "previous recording not finalized");
            }
        }

        let sample_rate = self.settings.lock().format.sample_rate;
        let recorder = match WavRecorder::create(path, sample_rate) {
            Ok(recorder) => recorder,
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot open record file");
                return Err(err.into());
            }
        };
        self.recorder.lock().active = Some(recorder);
        info!(path = %path.display(), sample_rate, "recording started");
        Ok(())
    }

    /// Finish the current recording. Returns the file written, if any, or
    /// the error that interrupted it.
    pub fn end_record(&self) -> Result<Option<PathBuf>, SynthError> {
        let (active, failure) = {
            let mut record = self.recorder.lock();
            record.paused = false;
            (record.active.take(), record.failure.take())
        };
        if let Some(err) = failure {
            warn!(%err, "recording was interrupted");
            return Err(err.into());
        }
        let Some(recorder) = active else {
            return Ok(None);
        };
        let bytes = recorder.data_len();
        let path = recorder.finish()?;
        info!(path = %path.display(), bytes, "recording finished");
        Ok(Some(path))
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.lock().active.is_some()
    }

    /// Suspend or resume writing to the current recording.
    pub fn pause(&self, paused: bool) {
        self.recorder.lock().paused = paused;
    }

    // ── Introspection ──

    /// Receiver of position, voice and buffer notifications.
    pub fn events(&self) -> Receiver<SynthEvent> {
        self.event_rx.clone()
    }

    /// Voices of all engines as of their last render pass.
    pub fn voice_infos(&self) -> Vec<VoiceInfo> {
        self.engines
            .lock()
            .engines
            .iter()
            .flat_map(SoundEngine::voice_infos)
            .collect()
    }

    pub fn voice_count(&self) -> usize {
        self.engines.lock().engines.iter().map(SoundEngine::voice_count).sum()
    }

    pub fn engine_count(&self) -> usize {
        self.engines.lock().engines.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.engines.lock().buffer_size
    }
}

impl Drop for Synth {
    fn drop(&mut self) {
        if let Some(recorder) = self.recorder.get_mut().active.take() {
            let _ = recorder.finish();
        }
    }
}
