//! Asset loading for OCHO - tracks, stems, voice packs and configuration

mod assets;
mod config;
mod loader;

pub use assets::{find_audio_file, TrackAssets, VoicePack, AUDIO_EXTENSIONS};
pub use config::{Config, ConfigError};
pub use loader::{to_stereo, LoadError, LoadedTrack, TrackLoader, TrackMetadata};
