//! SoundEngine — one render partition running on its own worker thread.
//!
//! Each engine owns a disjoint set of voices. The control domain talks to it
//! through a command channel; the render caller asks for a buffer with
//! [`SoundEngine::request_render`] and collects it with
//! [`SoundEngine::add_data`], so all engines render in parallel and their
//! outputs are summed in a fixed order.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use tracing::debug;

use crate::controls::{ControlSnapshot, EngineControls};
use crate::dsp::voice::{Voice, VoiceOutput, VoiceState};
use crate::synth::SynthEvent;

/// Public view of a voice, refreshed after every render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceInfo {
    pub token: i32,
    pub channel: i32,
    pub key: i32,
    pub velocity: i32,
    pub state: VoiceState,
    pub exclusive_class: i32,
    /// Playback position in sample frames.
    pub position: u32,
}

impl VoiceInfo {
    fn of(voice: &Voice) -> Self {
        VoiceInfo {
            token: voice.token(),
            channel: voice.channel(),
            key: voice.key(),
            velocity: voice.velocity(),
            state: voice.state(),
            exclusive_class: voice.exclusive_class(),
            position: voice.position(),
        }
    }
}

/// Voices to choke because a new voice of the same exclusive class starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChokeRequest {
    pub exclusive_class: i32,
    pub sf2_id: i32,
    pub preset_id: i32,
    /// Tokens of the starting batch, never choked by it.
    pub spared: Arc<[i32]>,
}

impl ChokeRequest {
    fn matches(&self, voice: &Voice) -> bool {
        voice.exclusive_class() == self.exclusive_class
            && voice.sf2_id() == self.sf2_id
            && voice.preset_id() == self.preset_id
            && !self.spared.contains(&voice.token())
    }
}

enum EngineCommand {
    AddVoice(Box<Voice>),
    Choke(ChokeRequest),
    Render { frames: usize },
    Clear,
    Shutdown,
}

/// Dry and reverb-send output of the last render pass.
#[derive(Debug, Default)]
struct EngineOutput {
    left: Vec<f32>,
    right: Vec<f32>,
    reverb_left: Vec<f32>,
    reverb_right: Vec<f32>,
}

impl EngineOutput {
    fn with_capacity(frames: usize) -> Self {
        EngineOutput {
            left: vec![0.0; frames],
            right: vec![0.0; frames],
            reverb_left: vec![0.0; frames],
            reverb_right: vec![0.0; frames],
        }
    }

    fn prepare(&mut self, frames: usize) {
        for buffer in [&mut self.left, &mut self.right, &mut self.reverb_left, &mut self.reverb_right] {
            if buffer.len() < frames {
                buffer.resize(frames, 0.0);
            }
            buffer[..frames].fill(0.0);
        }
    }
}

pub struct SoundEngine {
    index: usize,
    commands: Sender<EngineCommand>,
    done: Receiver<usize>,
    output: Arc<Mutex<EngineOutput>>,
    voice_count: Arc<AtomicUsize>,
    infos: Arc<Mutex<Vec<VoiceInfo>>>,
    pending_render: bool,
    thread: Option<JoinHandle<()>>,
}

impl SoundEngine {
    /// Start the worker thread of engine `index`.
    pub fn spawn(
        index: usize,
        buffer_size: usize,
        controls: Arc<EngineControls>,
        events: Sender<SynthEvent>,
    ) -> io::Result<Self> {
        let (commands, command_rx) = unbounded();
        let (done_tx, done) = bounded(1);
        let (ready_tx, ready_rx) = bounded(1);
        let output = Arc::new(Mutex::new(EngineOutput::with_capacity(buffer_size)));
        let voice_count = Arc::new(AtomicUsize::new(0));
        let infos = Arc::new(Mutex::new(Vec::new()));

        let worker = Worker {
            commands: command_rx,
            done: done_tx,
            output: Arc::clone(&output),
            voice_count: Arc::clone(&voice_count),
            infos: Arc::clone(&infos),
            controls,
            events,
            snapshot: ControlSnapshot::default(),
            voices: Vec::new(),
        };
        let thread = thread::Builder::new()
            .name(format!("sound-engine-{index}"))
            .spawn(move || {
                let _ = ready_tx.send(request_realtime_priority());
                worker.run();
            })?;

        let realtime = ready_rx.recv().unwrap_or(false);
        debug!(engine = index, realtime, "sound engine started");

        Ok(SoundEngine {
            index,
            commands,
            done,
            output,
            voice_count,
            infos,
            pending_render: false,
            thread: Some(thread),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Hand a voice over to this engine. It renders from the next pass on.
    pub fn add_voice(&self, voice: Voice) {
        self.voice_count.fetch_add(1, Ordering::AcqRel);
        if self.commands.send(EngineCommand::AddVoice(Box::new(voice))).is_err() {
            self.voice_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Choke the voices matching `request` before the next pass.
    pub fn choke(&self, request: ChokeRequest) {
        let _ = self.commands.send(EngineCommand::Choke(request));
    }

    /// Drop every voice without rendering it.
    pub fn clear(&self) {
        let _ = self.commands.send(EngineCommand::Clear);
    }

    /// Number of voices owned, including those still in the command queue.
    pub fn voice_count(&self) -> usize {
        self.voice_count.load(Ordering::Acquire)
    }

    /// Voices as of the last render pass.
    pub fn voice_infos(&self) -> Vec<VoiceInfo> {
        self.infos.lock().clone()
    }

    /// Start rendering `frames` frames on the worker.
    pub fn request_render(&mut self, frames: usize) {
        self.pending_render = self.commands.send(EngineCommand::Render { frames }).is_ok();
    }

    /// Wait for the requested pass and accumulate it into the four buffers.
    /// Adds nothing if no pass was requested or the worker is gone.
    pub fn add_data(&mut self, left: &mut [f32], right: &mut [f32], reverb_left: &mut [f32], reverb_right: &mut [f32]) {
        if !std::mem::take(&mut self.pending_render) {
            return;
        }
        let Ok(frames) = self.done.recv() else {
            return;
        };
        let output = self.output.lock();
        let pairs = [
            (left, &output.left),
            (right, &output.right),
            (reverb_left, &output.reverb_left),
            (reverb_right, &output.reverb_right),
        ];
        for (dst, src) in pairs {
            let n = frames.min(dst.len()).min(src.len());
            for (d, s) in dst[..n].iter_mut().zip(&src[..n]) {
                *d += s;
            }
        }
    }

    /// Stop the worker and wait for it. Its voices are dropped.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.commands.send(EngineCommand::Shutdown);
        let _ = thread.join();
        debug!(engine = self.index, "sound engine stopped");
    }
}

impl Drop for SoundEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Worker ──────────────────────────────────────────────────

struct Worker {
    commands: Receiver<EngineCommand>,
    done: Sender<usize>,
    output: Arc<Mutex<EngineOutput>>,
    voice_count: Arc<AtomicUsize>,
    infos: Arc<Mutex<Vec<VoiceInfo>>>,
    controls: Arc<EngineControls>,
    events: Sender<SynthEvent>,
    snapshot: ControlSnapshot,
    voices: Vec<Voice>,
}

impl Worker {
    fn run(mut self) {
        while let Ok(command) = self.commands.recv() {
            match command {
                EngineCommand::AddVoice(voice) => self.voices.push(*voice),
                EngineCommand::Choke(request) => {
                    for voice in self.voices.iter_mut().filter(|v| request.matches(v)) {
                        voice.choke();
                    }
                }
                EngineCommand::Render { frames } => {
                    self.render(frames);
                    if self.done.send(frames).is_err() {
                        break;
                    }
                }
                EngineCommand::Clear => self.clear(),
                EngineCommand::Shutdown => break,
            }
        }
        self.clear();
    }

    fn render(&mut self, frames: usize) {
        self.controls.refresh(&mut self.snapshot);
        {
            let mut output = self.output.lock();
            output.prepare(frames);
            let EngineOutput {
                left,
                right,
                reverb_left,
                reverb_right,
            } = &mut *output;
            let mut out = VoiceOutput {
                left: &mut left[..frames],
                right: &mut right[..frames],
                reverb_left: &mut reverb_left[..frames],
                reverb_right: &mut reverb_right[..frames],
            };
            for voice in &mut self.voices {
                voice.render(&self.snapshot, &mut out);
                if voice.key() == -1 && !voice.is_finished() {
                    send_event(
                        &self.events,
                        SynthEvent::Position {
                            token: voice.token(),
                            position: voice.position(),
                        },
                    );
                }
            }
        }
        self.remove_finished();
        self.publish();
    }

    fn remove_finished(&mut self) {
        let before = self.voices.len();
        let events = &self.events;
        self.voices.retain(|voice| {
            if voice.is_finished() {
                send_event(events, SynthEvent::VoiceFinished { token: voice.token() });
                false
            } else {
                true
            }
        });
        self.voice_count.fetch_sub(before - self.voices.len(), Ordering::AcqRel);
    }

    fn clear(&mut self) {
        for voice in self.voices.drain(..) {
            send_event(&self.events, SynthEvent::VoiceFinished { token: voice.token() });
            self.voice_count.fetch_sub(1, Ordering::AcqRel);
        }
        self.publish();
    }

    fn publish(&self) {
        let mut infos = self.infos.lock();
        infos.clear();
        infos.extend(self.voices.iter().map(VoiceInfo::of));
    }
}

/// Non-blocking send; a full or closed channel drops the event.
fn send_event(events: &Sender<SynthEvent>, event: SynthEvent) {
    let _ = events.try_send(event);
}

/// Ask the OS for FIFO scheduling on the current thread. Best effort:
/// unprivileged processes usually get a refusal and keep the default policy.
#[cfg(unix)]
fn request_realtime_priority() -> bool {
    // SAFETY: sched_param is plain data; pthread_self is always valid.
    unsafe {
        let priority = libc::sched_get_priority_min(libc::SCHED_FIFO);
        if priority < 0 {
            return false;
        }
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority;
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) == 0
    }
}

#[cfg(not(unix))]
fn request_realtime_priority() -> bool {
    false
}
