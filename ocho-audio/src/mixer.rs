//! Mixer - stem routing, volumes and the output bus

use std::fmt;

/// One of the four separated parts of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StemKind {
    Vocals,
    Drums,
    Bass,
    Other,
}

impl StemKind {
    pub const ALL: [StemKind; 4] = [Self::Vocals, Self::Drums, Self::Bass, Self::Other];

    pub fn index(self) -> usize {
        match self {
            Self::Vocals => 0,
            Self::Drums => 1,
            Self::Bass => 2,
            Self::Other => 3,
        }
    }

    /// File stem used for this part on disk (`vocals.wav`, ...)
    pub fn file_stem(self) -> &'static str {
        match self {
            Self::Vocals => "vocals",
            Self::Drums => "drums",
            Self::Bass => "bass",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for StemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Per-stem switch and level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StemChannel {
    pub enabled: bool,
    pub volume: f32,
}

impl Default for StemChannel {
    fn default() -> Self {
        Self {
            enabled: true,
            volume: 1.0,
        }
    }
}

/// Levels requested by the user
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixSettings {
    /// Music level, applied to the full mix and to every stem
    pub master_volume: f32,
    /// Spoken count level, independent of the music
    pub voice_volume: f32,
    pub stems: [StemChannel; 4],
}

impl Default for MixSettings {
    fn default() -> Self {
        Self {
            master_volume: 1.0,
            voice_volume: 1.0,
            stems: [StemChannel::default(); 4],
        }
    }
}

impl MixSettings {
    pub fn clamped(mut self) -> Self {
        self.master_volume = clamp_volume(self.master_volume);
        self.voice_volume = clamp_volume(self.voice_volume);
        for stem in &mut self.stems {
            stem.volume = clamp_volume(stem.volume);
        }
        self
    }

    pub fn stem(&self, kind: StemKind) -> &StemChannel {
        &self.stems[kind.index()]
    }

    pub fn stem_mut(&mut self, kind: StemKind) -> &mut StemChannel {
        &mut self.stems[kind.index()]
    }
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.clamp(0.0, 2.0)
    } else {
        1.0
    }
}

/// Turns [`MixSettings`] into source gains and finishes the output bus
#[derive(Debug, Clone, Default)]
pub struct Mixer {
    settings: MixSettings,
}

impl Mixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_settings(&mut self, settings: MixSettings) {
        self.settings = settings.clamped();
    }

    pub fn settings(&self) -> &MixSettings {
        &self.settings
    }

    /// Gain for the single-file mix
    pub fn mix_gain(&self) -> f32 {
        self.settings.master_volume
    }

    /// Effective stem gain: master x stem volume, zero when disabled
    pub fn stem_gain(&self, kind: StemKind) -> f32 {
        let stem = self.settings.stem(kind);
        if stem.enabled {
            self.settings.master_volume * stem.volume
        } else {
            0.0
        }
    }

    pub fn voice_gain(&self) -> f32 {
        self.settings.voice_volume
    }

    /// Apply the soft clipper to the summed output bus
    pub fn finish(&self, output: &mut [f32]) {
        for sample in output.iter_mut() {
            *sample = soft_clip(*sample);
        }
    }
}

/// Soft clip threshold
const SOFT_CLIP_THRESHOLD: f32 = 0.75;
/// Soft clip ceiling
const SOFT_CLIP_CEILING: f32 = 0.89;

/// Gentle soft clipper for the output bus.
///
/// Transparent below the threshold, then approaches the ceiling along an
/// exponential knee so a loud count over a loud track never hard-clips.
#[inline(always)]
fn soft_clip(x: f32) -> f32 {
    let abs_x = x.abs();

    if abs_x <= SOFT_CLIP_THRESHOLD {
        return x;
    }

    let sign = x.signum();
    let knee_width = SOFT_CLIP_CEILING - SOFT_CLIP_THRESHOLD;
    let ratio = (abs_x - SOFT_CLIP_THRESHOLD) / knee_width;

    let compressed = SOFT_CLIP_THRESHOLD + knee_width * (1.0 - (-ratio * 3.0).exp());
    sign * compressed.min(SOFT_CLIP_CEILING)
}
