use crate::scheduler::TransportState;
use thiserror::Error;

/// Errors reported by the playback engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Missing asset: {0}")]
    MissingAsset(String),
    #[error("No track loaded")]
    NoTrackLoaded,
    #[error("Cannot {action} while {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: TransportState,
    },
}
