//! Audio file loading and decoding

use ocho_audio::StemKind;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during track loading
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No audio track found in file")]
    NoAudioTrack,
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Resample error: {0}")]
    Resample(String),
    #[error("Missing {0} stem")]
    MissingStem(StemKind),
    #[error("{kind} stem: {source}")]
    Stem {
        kind: StemKind,
        #[source]
        source: Box<LoadError>,
    },
}

/// Track metadata
#[derive(Debug, Clone, Default)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub duration_secs: f64,
    pub source_sample_rate: u32,
    pub source_channels: u16,
}

/// A loaded and decoded audio file
#[derive(Debug, Clone)]
pub struct LoadedTrack {
    /// Interleaved stereo samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    pub metadata: TrackMetadata,
}

impl LoadedTrack {
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }
}

/// Audio file loader using Symphonia
pub struct TrackLoader {
    target_sample_rate: u32,
}

impl Default for TrackLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackLoader {
    /// Create a new track loader with default 48kHz sample rate
    pub fn new() -> Self {
        Self::with_sample_rate(48000)
    }

    /// Create a new track loader decoding to a specific sample rate
    pub fn with_sample_rate(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Load and decode an audio file to interleaved stereo at the target rate
    pub fn load(&self, path: &Path) -> Result<LoadedTrack, LoadError> {
        let file = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // Create hint from file extension
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| LoadError::Decode(e.to_string()))?;

        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(LoadError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let source_sample_rate = codec_params.sample_rate.unwrap_or(44100);
        let mut channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .unwrap_or(2);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| LoadError::Decode(e.to_string()))?;

        let mut metadata = extract_metadata(&mut *format, path);
        metadata.source_sample_rate = source_sample_rate;

        let mut samples: Vec<f32> = Vec::new();
        let mut skipped_packets = 0usize;

        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "stopping at unreadable packet");
                    break;
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(_) => {
                    skipped_packets += 1;
                    continue;
                }
            };

            // Convert to f32 interleaved
            let spec = *decoded.spec();
            channels = spec.channels.count() as u16;
            let duration = decoded.capacity() as u64;

            let mut sample_buf = SampleBuffer::<f32>::new(duration, spec);
            sample_buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(sample_buf.samples());
        }

        if skipped_packets > 0 {
            warn!(path = %path.display(), skipped_packets, "skipped undecodable packets");
        }
        if samples.is_empty() {
            return Err(LoadError::Decode("no audio decoded".into()));
        }

        metadata.source_channels = channels;
        let stereo = to_stereo(&samples, channels as usize);
        metadata.duration_secs = (stereo.len() / 2) as f64 / source_sample_rate as f64;

        let (samples, sample_rate) = if source_sample_rate != self.target_sample_rate {
            (
                self.resample(&stereo, source_sample_rate)?,
                self.target_sample_rate,
            )
        } else {
            (stereo, source_sample_rate)
        };

        debug!(
            path = %path.display(),
            source_sample_rate,
            sample_rate,
            channels,
            duration = metadata.duration_secs,
            "decoded"
        );

        Ok(LoadedTrack {
            samples,
            sample_rate,
            metadata,
        })
    }

    /// Resample interleaved stereo audio to the target sample rate
    fn resample(&self, samples: &[f32], source_rate: u32) -> Result<Vec<f32>, LoadError> {
        use rubato::{FftFixedInOut, Resampler};

        const CHANNELS: usize = 2;
        let frames = samples.len() / CHANNELS;

        let mut resampler = FftFixedInOut::<f32>::new(
            source_rate as usize,
            self.target_sample_rate as usize,
            1024,
            CHANNELS,
        )
        .map_err(|e| LoadError::Resample(e.to_string()))?;

        // Deinterleave
        let deinterleaved: Vec<Vec<f32>> = (0..CHANNELS)
            .map(|ch| (0..frames).map(|f| samples[f * CHANNELS + ch]).collect())
            .collect();

        let chunk_size = resampler.input_frames_next();
        let mut output: Vec<Vec<f32>> = vec![Vec::new(); CHANNELS];

        let mut pos = 0;
        while pos + chunk_size <= frames {
            let input_refs: Vec<&[f32]> = deinterleaved
                .iter()
                .map(|ch| &ch[pos..pos + chunk_size])
                .collect();

            let resampled = resampler
                .process(&input_refs, None)
                .map_err(|e| LoadError::Resample(e.to_string()))?;

            for (ch, data) in resampled.into_iter().enumerate() {
                output[ch].extend(data);
            }

            pos += chunk_size;
        }

        // Remaining frames, padded with zeros; keep only the proportional output
        if pos < frames {
            let remaining = frames - pos;
            let padded: Vec<Vec<f32>> = deinterleaved
                .iter()
                .map(|ch| {
                    let mut v = ch[pos..].to_vec();
                    v.resize(chunk_size, 0.0);
                    v
                })
                .collect();

            let input_refs: Vec<&[f32]> = padded.iter().map(|v| v.as_slice()).collect();
            let resampled = resampler
                .process(&input_refs, None)
                .map_err(|e| LoadError::Resample(e.to_string()))?;

            let output_frames =
                (remaining * self.target_sample_rate as usize) / source_rate as usize;
            for (ch, data) in resampled.into_iter().enumerate() {
                output[ch].extend(&data[..output_frames.min(data.len())]);
            }
        }

        // Reinterleave
        let output_frames = output[0].len().min(output[1].len());
        let mut interleaved = Vec::with_capacity(output_frames * CHANNELS);
        for frame_idx in 0..output_frames {
            interleaved.push(output[0][frame_idx]);
            interleaved.push(output[1][frame_idx]);
        }

        Ok(interleaved)
    }
}

/// Convert interleaved audio with any channel count to interleaved stereo.
///
/// Mono is duplicated. Channels beyond the first two are folded into both
/// sides at half gain.
pub fn to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        2 => samples.to_vec(),
        n => samples
            .chunks_exact(n)
            .flat_map(|frame| {
                let extra: f32 = frame[2..].iter().sum::<f32>() * 0.5 / (n - 2) as f32;
                [frame[0] + extra, frame[1] + extra]
            })
            .collect(),
    }
}

fn extract_metadata(format: &mut dyn FormatReader, path: &Path) -> TrackMetadata {
    let mut metadata = TrackMetadata {
        title: path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Unknown")
            .to_string(),
        artist: "Unknown".to_string(),
        ..Default::default()
    };

    if let Some(meta) = format.metadata().current() {
        for tag in meta.tags() {
            match tag.std_key {
                Some(StandardTagKey::TrackTitle) => metadata.title = tag.value.to_string(),
                Some(StandardTagKey::Artist) => metadata.artist = tag.value.to_string(),
                _ => {}
            }
        }
    }

    metadata
}

/// Helpers shared by the loader tests of this crate
#[cfg(test)]
pub(crate) mod testutil {
    use std::path::{Path, PathBuf};

    /// A fresh scratch directory under the system temp dir
    pub fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ocho-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write a 16-bit PCM WAV file holding a constant tone level
    pub fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: usize, level: i16) {
        let data_len = (frames * channels as usize * 2) as u32;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
        bytes.extend_from_slice(&(channels * 2).to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for _ in 0..frames * channels as usize {
            bytes.extend_from_slice(&level.to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{scratch_dir, write_wav};
    use super::*;

    #[test]
    fn test_to_stereo() {
        assert_eq!(to_stereo(&[0.1, 0.2], 1), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(to_stereo(&[0.1, 0.2], 2), vec![0.1, 0.2]);
        assert_eq!(to_stereo(&[0.25, 0.5, 0.5, 0.0], 4), vec![0.375, 0.625]);
        assert!(to_stereo(&[0.1], 0).is_empty());
    }

    #[test]
    fn test_load_mono_wav_as_stereo() {
        let dir = scratch_dir("loader-mono");
        let path = dir.join("click.wav");
        write_wav(&path, 44100, 1, 22050, 8192);

        let track = TrackLoader::with_sample_rate(44100).load(&path).unwrap();
        assert_eq!(track.sample_rate, 44100);
        assert_eq!(track.frames(), 22050);
        assert_eq!(track.metadata.source_channels, 1);
        assert!((track.metadata.duration_secs - 0.5).abs() < 1e-6);
        assert!((track.samples[0] - 0.25).abs() < 1e-3);
        assert_eq!(track.samples[0], track.samples[1]);
    }

    #[test]
    fn test_load_resamples_to_target() {
        let dir = scratch_dir("loader-resample");
        let path = dir.join("tone.wav");
        write_wav(&path, 44100, 2, 22050, 4096);

        let track = TrackLoader::with_sample_rate(48000).load(&path).unwrap();
        assert_eq!(track.sample_rate, 48000);
        let expected = 24000.0;
        assert!((track.frames() as f64 - expected).abs() / expected < 0.05);
    }

    #[test]
    fn test_missing_file() {
        let result = TrackLoader::new().load(Path::new("/definitely/not/here.wav"));
        assert!(matches!(result, Err(LoadError::Io(_))));
    }
}
