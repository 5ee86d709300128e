//! Track, stem and voice pack assets

use crate::loader::{LoadError, LoadedTrack, TrackLoader};
use ocho_analysis::{StructuralMetadata, TrackTiming};
use ocho_audio::{AudioBuffer, StemKind, TrackBundle, VoiceBank, VoiceSample};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Audio file extensions looked up for stems and voices
pub const AUDIO_EXTENSIONS: [&str; 6] = ["wav", "mp3", "flac", "ogg", "m4a", "aac"];

/// Find `<dir>/<stem>.<ext>` for any supported extension
pub fn find_audio_file(dir: &Path, stem: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;

    let mut matches: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_stem().and_then(|s| s.to_str()) == Some(stem)
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| AUDIO_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        })
        .collect();

    // Sort for a stable pick when several formats exist
    matches.sort();
    matches.into_iter().next()
}

/// A decoded track: the mixed file and, when complete, its four stems
#[derive(Debug, Clone)]
pub struct TrackAssets {
    pub name: String,
    pub mix: LoadedTrack,
    /// Vocals, drums, bass, other
    pub stems: Option<[LoadedTrack; 4]>,
}

impl TrackAssets {
    /// Load the mix and, if `stems_dir` is given, all four stems.
    ///
    /// A missing or undecodable stem drops the whole stem set; the mix still
    /// plays. A missing mix is an error.
    pub fn load(
        loader: &TrackLoader,
        mix_path: &Path,
        stems_dir: Option<&Path>,
    ) -> Result<Self, LoadError> {
        let mix = loader.load(mix_path)?;
        let name = mix.metadata.title.clone();

        let stems = stems_dir.and_then(|dir| match Self::load_stems(loader, dir) {
            Ok(stems) => Some(stems),
            Err(reason) => {
                warn!(dir = %dir.display(), %reason, "stems unavailable, using the single file");
                None
            }
        });

        info!(
            name = %name,
            duration = mix.metadata.duration_secs,
            stems = stems.is_some(),
            "track assets loaded"
        );

        Ok(Self { name, mix, stems })
    }

    fn load_stems(loader: &TrackLoader, dir: &Path) -> Result<[LoadedTrack; 4], LoadError> {
        let load = |kind: StemKind| -> Result<LoadedTrack, LoadError> {
            let path = find_audio_file(dir, kind.file_stem()).ok_or(LoadError::MissingStem(kind))?;
            loader.load(&path).map_err(|e| LoadError::Stem {
                kind,
                source: Box::new(e),
            })
        };
        let [vocals, drums, bass, other] = StemKind::ALL;
        Ok([load(vocals)?, load(drums)?, load(bass)?, load(other)?])
    }

    pub fn duration(&self) -> f64 {
        if self.mix.sample_rate == 0 {
            return 0.0;
        }
        self.mix.frames() as f64 / self.mix.sample_rate as f64
    }

    /// Package the assets for the engine
    pub fn into_bundle(
        self,
        timing: TrackTiming,
        structure: Option<StructuralMetadata>,
    ) -> TrackBundle {
        TrackBundle {
            name: Some(self.name),
            mix: to_buffer(self.mix),
            stems: self.stems.map(|set| set.map(to_buffer)),
            timing,
            structure,
        }
    }
}

fn to_buffer(track: LoadedTrack) -> AudioBuffer {
    AudioBuffer::new(Arc::new(track.samples), track.sample_rate)
}

/// The spoken numbers 1-8 in one language
#[derive(Debug, Clone)]
pub struct VoicePack {
    pub dir: PathBuf,
    pub language: Option<String>,
    bank: VoiceBank,
}

impl VoicePack {
    /// Load `1..8.<ext>` from `dir/<language>/`, falling back to `dir/`.
    ///
    /// Missing or undecodable numbers are logged and left out of the bank.
    pub fn load(loader: &TrackLoader, dir: &Path, language: Option<&str>) -> Self {
        let localized = language
            .map(|lang| dir.join(lang))
            .filter(|path| path.is_dir());

        let voice_dir = match (&localized, language) {
            (Some(path), _) => path.clone(),
            (None, Some(lang)) => {
                warn!(language = lang, dir = %dir.display(), "no voices for language, using the default set");
                dir.to_path_buf()
            }
            (None, None) => dir.to_path_buf(),
        };

        let mut bank = VoiceBank::new();
        for number in 1..=8u8 {
            let Some(path) = find_audio_file(&voice_dir, &number.to_string()) else {
                continue;
            };
            match loader.load(&path) {
                Ok(track) => {
                    bank.insert(
                        number,
                        VoiceSample::new(Arc::new(track.samples), track.sample_rate),
                    );
                }
                Err(e) => warn!(number, path = %path.display(), error = %e, "voice failed to decode"),
            }
        }

        let missing = bank.missing();
        if missing.is_empty() {
            info!(dir = %voice_dir.display(), "voice pack loaded");
        } else {
            warn!(dir = %voice_dir.display(), ?missing, "voice pack incomplete");
        }

        Self {
            dir: voice_dir,
            language: localized.and(language.map(str::to_string)),
            bank,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bank.is_complete()
    }

    pub fn missing(&self) -> Vec<u8> {
        self.bank.missing()
    }

    pub fn bank(&self) -> &VoiceBank {
        &self.bank
    }

    pub fn into_bank(self) -> VoiceBank {
        self.bank
    }
}
