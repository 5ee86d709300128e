//! Reader for the JSON reports printed by the external track analyzer
//!
//! Two report shapes are understood. The tempo-only analyzer prints
//! `{"bpm": .., "offset": ..}` (or `{"error": ..}` when it gave up). The
//! structural analyzer adds `duration`, `song_start_time`, `bridges` and a
//! resolved `layout`. Unknown fields are ignored.

use crate::beatgrid::{LayoutSegment, RowStart, StructuralMetadata, TrackTiming};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Tempo assumed when the analyzer could not produce one
pub const FALLBACK_BPM: f64 = 120.0;

/// Errors that can occur while reading an analysis report
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed analysis report: {0}")]
    Json(#[from] serde_json::Error),
}

/// A bridge entry: either bare seconds or an object carrying `time_sec`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BridgeMarker {
    Seconds(f64),
    Detailed {
        #[serde(alias = "time")]
        time_sec: f64,
    },
}

impl BridgeMarker {
    pub fn time(&self) -> f64 {
        match self {
            Self::Seconds(t) => *t,
            Self::Detailed { time_sec } => *time_sec,
        }
    }
}

/// Layout segment exactly as the analyzer prints it
#[derive(Debug, Clone, Deserialize)]
pub struct ReportSegment {
    pub from_beat: u32,
    pub to_beat: u32,
    pub time_start: f64,
    pub time_end: f64,
    pub row1_start: u8,
}

/// Parsed analyzer output
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub bpm: Option<f64>,
    #[serde(default)]
    pub offset: Option<f64>,
    #[serde(default)]
    pub song_start_time: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub bridges: Vec<BridgeMarker>,
    #[serde(default)]
    pub layout: Vec<ReportSegment>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AnalysisReport {
    pub fn from_json(json: &str) -> Result<Self, ReportError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ReportError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Tempo and first beat, falling back to 120 BPM from 0 s when the
    /// analyzer reported an error or an unusable tempo
    pub fn timing(&self) -> TrackTiming {
        if let Some(ref error) = self.error {
            warn!(%error, "analyzer reported an error, using fallback timing");
            return TrackTiming::new(FALLBACK_BPM, 0.0);
        }

        let bpm = match self.bpm {
            Some(bpm) if bpm.is_finite() && bpm > 0.0 => bpm,
            other => {
                warn!(bpm = ?other, "analyzer tempo unusable, using fallback timing");
                return TrackTiming::new(FALLBACK_BPM, 0.0);
            }
        };

        let offset = self
            .offset
            .or(self.song_start_time)
            .filter(|o| o.is_finite() && *o >= 0.0)
            .unwrap_or(0.0);

        TrackTiming::new(bpm, offset)
    }

    /// Structure with inconsistent entries dropped
    pub fn structure(&self) -> StructuralMetadata {
        let mut bridges = Vec::with_capacity(self.bridges.len());
        for marker in &self.bridges {
            let time = marker.time();
            let in_order = bridges.last().map_or(true, |&prev: &f64| time > prev);
            if time.is_finite() && time >= 0.0 && in_order {
                bridges.push(time);
            } else {
                warn!(time, "dropping inconsistent bridge timestamp");
            }
        }

        let layout = self
            .layout
            .iter()
            .filter_map(|s| {
                let Some(row1_start) = RowStart::from_number(s.row1_start) else {
                    warn!(row1_start = s.row1_start, "dropping layout segment with invalid row start");
                    return None;
                };
                if !(s.time_end >= s.time_start) {
                    warn!(
                        time_start = s.time_start,
                        time_end = s.time_end,
                        "dropping layout segment that ends before it starts"
                    );
                    return None;
                }
                Some(LayoutSegment {
                    from_beat: s.from_beat,
                    to_beat: s.to_beat,
                    time_start: s.time_start,
                    time_end: s.time_end,
                    row1_start,
                })
            })
            .collect();

        StructuralMetadata { bridges, layout }
    }
}
