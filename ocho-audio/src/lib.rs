//! Playback engine for OCHO
//!
//! This module provides the playback pipeline:
//! - Source: decoded track buffers with their own playhead
//! - Mixer: stem routing, master and voice volume, output bus
//! - Voice: spoken count samples scheduled on the device clock
//! - Scheduler: transport state, beat announcements, voice look-ahead
//! - Engine: command/event channels and the engine thread

mod engine;
mod error;
mod mixer;
mod output;
mod render;
mod scheduler;
mod source;
mod voice;
mod voicing;

pub use engine::{
    run_engine, AudioEngine, EngineCommand, EngineConfig, EngineEvent, Fallback, TrackBundle,
};
pub use error::EngineError;
pub use mixer::{MixSettings, Mixer, StemChannel, StemKind};
pub use output::{CpalOutput, NullOutput, OutputDevice};
pub use render::{AudioBuffer, RenderState, SharedRenderState};
pub use scheduler::{PlaybackScheduler, PlaybackSnapshot, PlaybackState, TransportState};
pub use source::{SourceState, TrackSource};
pub use voice::{ScheduledVoice, VoiceBank, VoiceLayer, VoiceSample};
pub use voicing::{
    select_voicing, ImmediateVoicing, LookAheadVoicing, VoicingContext, VoicingStrategy,
};
