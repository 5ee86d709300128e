//! Which beats of the count get a spoken voice

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Voicing density selected by the dancer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceFilterMode {
    /// No voice at all
    Mute,
    /// Only the one
    On1,
    /// The one and the five
    On1And5,
    /// The three steps of each half (1-2-3, 5-6-7), taps silent
    On1Times3,
    /// Every beat
    #[default]
    Full,
}

impl VoiceFilterMode {
    pub const ALL: [VoiceFilterMode; 5] = [
        Self::Mute,
        Self::On1,
        Self::On1And5,
        Self::On1Times3,
        Self::Full,
    ];

    /// Whether a beat numbered `beat_number` (1..=8) should be spoken
    #[inline]
    pub fn should_voice(self, beat_number: u8) -> bool {
        if !(1..=8).contains(&beat_number) {
            return false;
        }
        match self {
            Self::Mute => false,
            Self::On1 => beat_number == 1,
            Self::On1And5 => beat_number == 1 || beat_number == 5,
            Self::On1Times3 => beat_number != 4 && beat_number != 8,
            Self::Full => true,
        }
    }

    /// Next mode in [`Self::ALL`] order, wrapping around
    pub fn cycle(self) -> Self {
        let index = Self::ALL.iter().position(|m| *m == self).unwrap_or(0);
        Self::ALL[(index + 1) % Self::ALL.len()]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mute => "mute",
            Self::On1 => "on1",
            Self::On1And5 => "on1and5",
            Self::On1Times3 => "on1times3",
            Self::Full => "full",
        }
    }
}

/// Free-function form of [`VoiceFilterMode::should_voice`]
#[inline]
pub fn should_voice(mode: VoiceFilterMode, beat_number: u8) -> bool {
    mode.should_voice(beat_number)
}

impl fmt::Display for VoiceFilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoiceFilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "unknown voice mode '{}', expected one of: mute, on1, on1and5, on1times3, full",
                    s
                )
            })
    }
}
