//! DSP — sample voices, their modulation graph and the master effects.
//!
//! Everything here runs on the render threads except voice construction,
//! which happens in the control domain before a voice is handed to an
//! engine.

pub mod chorus;
pub mod envelope;
pub mod equalizer;
pub mod filter;
pub mod limiter;
pub mod modulator;
pub mod modulator_group;
pub mod oscillator;
pub mod reverb;
pub mod sample;
pub mod voice;
pub mod voice_param;
