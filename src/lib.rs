//! Real-time polyphonic soundfont synthesis core.
//!
//! Voices are built from an [`AttributeStore`] describing presets,
//! instruments and samples, rendered in parallel by [`SoundEngine`]
//! partitions, and mixed through the master effects chain by [`Synth`].

pub mod config;
pub mod controls;
pub mod dsp;
pub mod error;
pub mod recorder;
pub mod sound_engine;
pub mod store;
pub mod synth;

pub use config::{AudioFormat, SynthConfig};
pub use error::{ConfigError, StoreError, SynthError};
pub use sound_engine::{SoundEngine, VoiceInfo};
pub use store::{AttributeStore, AttributeType, AttributeValue, ElementId, ElementKind, MemoryStore, ModulatorData};
pub use synth::{Synth, SynthEvent};

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
