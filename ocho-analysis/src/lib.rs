//! Beat grid logic for OCHO
//!
//! Turns tempo, offset and optional structure into a labeled 1-8 beat grid,
//! decides which beats get a spoken count, and finds grid positions for
//! arbitrary playback times.

mod beatgrid;
mod cursor;
mod report;
mod voice_filter;

pub use beatgrid::{
    BeatEvent, BeatGrid, BeatGridBuilder, Labeling, LayoutSegment, RowStart, StructuralMetadata,
    TrackTiming, BRIDGE_BEATS, COUNT_LENGTH, MIN_SEGMENT_BEATS, SEGMENT_TOLERANCE_SECS,
    VERSE_BEATS,
};
pub use cursor::CursorSync;
pub use report::{AnalysisReport, BridgeMarker, ReportError, ReportSegment, FALLBACK_BPM};
pub use voice_filter::{should_voice, VoiceFilterMode};
