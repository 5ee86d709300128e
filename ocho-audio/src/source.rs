//! Track source - one decoded buffer with its own playhead

use std::sync::Arc;

/// Playback state for a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// A decoded stereo buffer played back at the device rate
pub struct TrackSource {
    /// Audio samples (interleaved stereo) - Arc to avoid copying through channels
    samples: Arc<Vec<f32>>,
    /// Sample rate of the decoded audio
    sample_rate: u32,
    /// Source frames advanced per output frame
    step: f64,
    /// Current playback position in frames
    position: f64,
    state: SourceState,
    /// Target gain
    gain: f32,
    /// Smoothed gain (interpolates toward gain to prevent clicks)
    smoothed_gain: f32,
    /// Set when the playhead ran past the last frame, cleared by seek/stop
    ended: bool,
}

impl TrackSource {
    /// Smoothing coefficient for gain changes (~5ms at 48kHz)
    const GAIN_SMOOTH_COEFF: f32 = 0.995;

    pub fn new(samples: Arc<Vec<f32>>, sample_rate: u32, device_rate: u32) -> Self {
        let step = if device_rate == 0 {
            1.0
        } else {
            sample_rate as f64 / device_rate as f64
        };
        Self {
            samples,
            sample_rate,
            step,
            position: 0.0,
            state: SourceState::Stopped,
            gain: 1.0,
            smoothed_gain: 1.0,
            ended: false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.samples.len() >= 2 && self.sample_rate > 0
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    pub fn play(&mut self) {
        if self.is_loaded() && !self.ended {
            self.state = SourceState::Playing;
        }
    }

    pub fn pause(&mut self) {
        if self.state == SourceState::Playing {
            self.state = SourceState::Paused;
        }
    }

    /// Stop playback and reset position
    pub fn stop(&mut self) {
        self.state = SourceState::Stopped;
        self.position = 0.0;
        self.ended = false;
    }

    /// Set playback position in seconds, clamped to the track
    pub fn seek(&mut self, position_secs: f64) {
        let secs = if position_secs.is_finite() {
            position_secs.clamp(0.0, self.duration())
        } else {
            0.0
        };
        self.position = secs * self.sample_rate as f64;
        self.ended = false;
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, 2.0);
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// Track duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Current position in seconds
    pub fn position_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.position / self.sample_rate as f64
    }

    /// Add this source into an interleaved stereo buffer
    pub fn process(&mut self, output: &mut [f32]) {
        if self.state != SourceState::Playing {
            return;
        }

        let frames = self.frames();

        for frame in output.chunks_mut(2) {
            let pos = self.position as usize;

            if pos >= frames {
                // Hold the playhead at the end so position reads the duration
                self.position = frames as f64;
                self.state = SourceState::Stopped;
                self.ended = true;
                break;
            }

            self.smoothed_gain = Self::GAIN_SMOOTH_COEFF * self.smoothed_gain
                + (1.0 - Self::GAIN_SMOOTH_COEFF) * self.gain;

            // Linear interpolation for non-integer positions
            let frac = self.position.fract() as f32;
            let l0 = self.samples[pos * 2];
            let r0 = self.samples[pos * 2 + 1];
            let (l, r) = if pos + 1 < frames {
                let l1 = self.samples[pos * 2 + 2];
                let r1 = self.samples[pos * 2 + 3];
                (l0 + frac * (l1 - l0), r0 + frac * (r1 - r0))
            } else {
                (l0, r0)
            };

            frame[0] += l * self.smoothed_gain;
            if frame.len() > 1 {
                frame[1] += r * self.smoothed_gain;
            }

            self.position += self.step;
        }
    }
}
