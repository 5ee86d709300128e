//! Render state shared between the scheduler and the output callback

use crate::mixer::{MixSettings, Mixer, StemKind};
use crate::source::TrackSource;
use crate::voice::{ScheduledVoice, VoiceBank, VoiceLayer};
use parking_lot::Mutex;
use std::sync::Arc;

pub type SharedRenderState = Arc<Mutex<RenderState>>;

/// A decoded buffer ready for playback
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Interleaved stereo samples
    pub samples: Arc<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Arc<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        (self.samples.len() / 2) as f64 / self.sample_rate as f64
    }
}

/// Everything the device callback needs to produce sound.
///
/// Owns the device clock: a count of frames rendered since creation. Voices
/// are scheduled against that clock, so they land at the same frame
/// regardless of when the control thread wakes up.
pub struct RenderState {
    sample_rate: u32,
    clock: u64,
    mix: Option<TrackSource>,
    stems: Option<[TrackSource; 4]>,
    stems_active: bool,
    voices: VoiceLayer,
    bank: VoiceBank,
    mixer: Mixer,
}

impl RenderState {
    pub fn new(sample_rate: u32, bank: VoiceBank) -> Self {
        Self {
            sample_rate,
            clock: 0,
            mix: None,
            stems: None,
            stems_active: false,
            voices: VoiceLayer::new(sample_rate),
            bank,
            mixer: Mixer::new(),
        }
    }

    pub fn into_shared(self) -> SharedRenderState {
        Arc::new(Mutex::new(self))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered since creation
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn voice_bank(&self) -> &VoiceBank {
        &self.bank
    }

    /// Replace the loaded track, tearing down the previous one and its voices
    pub fn load(&mut self, mix: AudioBuffer, stems: Option<[AudioBuffer; 4]>) {
        self.unload();
        let rate = self.sample_rate;
        self.mix = Some(TrackSource::new(mix.samples, mix.sample_rate, rate));
        self.stems = stems.map(|set| set.map(|s| TrackSource::new(s.samples, s.sample_rate, rate)));
        self.apply_gains();
    }

    pub fn unload(&mut self) {
        self.voices.cancel_all();
        self.mix = None;
        self.stems = None;
        self.stems_active = false;
    }

    pub fn is_loaded(&self) -> bool {
        self.mix.as_ref().is_some_and(|m| m.is_loaded())
    }

    pub fn has_stems(&self) -> bool {
        self.stems.is_some()
    }

    pub fn stems_active(&self) -> bool {
        self.stems_active && self.stems.is_some()
    }

    /// Switch between the single file and the stem set.
    ///
    /// The set being left is paused; the caller re-seeks the new set. Returns
    /// false when stems were requested but none are loaded.
    pub fn set_stems_active(&mut self, active: bool) -> bool {
        if active && self.stems.is_none() {
            return false;
        }
        if active != self.stems_active {
            self.for_each_active(|s| s.pause());
            self.stems_active = active;
        }
        true
    }

    /// Run `f` on every source of the active set
    fn for_each_active(&mut self, mut f: impl FnMut(&mut TrackSource)) {
        if self.stems_active {
            if let Some(stems) = self.stems.as_mut() {
                stems.iter_mut().for_each(&mut f);
                return;
            }
        }
        if let Some(mix) = self.mix.as_mut() {
            f(mix);
        }
    }

    /// Source whose playhead defines the track position
    fn master(&self) -> Option<&TrackSource> {
        if self.stems_active {
            if let Some(stems) = self.stems.as_ref() {
                let vocals = &stems[StemKind::Vocals.index()];
                if vocals.is_loaded() {
                    return Some(vocals);
                }
                return stems.iter().find(|s| s.is_loaded());
            }
        }
        self.mix.as_ref()
    }

    pub fn play(&mut self) {
        self.for_each_active(|s| s.play());
    }

    pub fn pause(&mut self) {
        self.for_each_active(|s| s.pause());
    }

    pub fn stop(&mut self) {
        self.for_each_active(|s| s.stop());
    }

    /// Move every source of the active set to the same position
    pub fn seek(&mut self, position_secs: f64) {
        self.for_each_active(|s| s.seek(position_secs));
    }

    pub fn position(&self) -> f64 {
        self.master().map_or(0.0, |m| m.position_secs())
    }

    pub fn duration(&self) -> f64 {
        self.master().map_or(0.0, |m| m.duration())
    }

    pub fn master_ended(&self) -> bool {
        self.master().is_some_and(|m| m.has_ended())
    }

    /// Positions of the four stems (empty without stems)
    pub fn stem_positions(&self) -> Vec<f64> {
        self.stems
            .as_ref()
            .map(|set| set.iter().map(|s| s.position_secs()).collect())
            .unwrap_or_default()
    }

    pub fn set_mix(&mut self, settings: MixSettings) {
        self.mixer.set_settings(settings);
        self.apply_gains();
    }

    fn apply_gains(&mut self) {
        let mix_gain = self.mixer.mix_gain();
        if let Some(mix) = self.mix.as_mut() {
            mix.set_gain(mix_gain);
        }
        if let Some(stems) = self.stems.as_mut() {
            for kind in StemKind::ALL {
                stems[kind.index()].set_gain(self.mixer.stem_gain(kind));
            }
        }
        self.voices.set_gain(self.mixer.voice_gain());
    }

    /// Register the voice for `beat_number` at `start_frame`.
    ///
    /// Returns false when the bank has no sample for that number.
    pub fn schedule_voice(&mut self, beat_index: usize, beat_number: u8, start_frame: u64) -> bool {
        let Some(sample) = self.bank.get(beat_number) else {
            return false;
        };
        let info = ScheduledVoice {
            beat_index,
            beat_number,
            start_frame,
        };
        self.voices.schedule(info, sample.clone());
        true
    }

    pub fn cancel_voices(&mut self) -> usize {
        self.voices.cancel_all()
    }

    pub fn scheduled_voices(&self) -> Vec<ScheduledVoice> {
        self.voices.scheduled().copied().collect()
    }

    pub fn voices_scheduled_total(&self) -> usize {
        self.voices.scheduled_total()
    }

    /// Render one interleaved stereo buffer and advance the device clock
    pub fn render(&mut self, output: &mut [f32]) {
        output.fill(0.0);

        self.for_each_active(|s| s.process(output));
        self.voices.render(output, self.clock);
        self.mixer.finish(output);

        self.clock += (output.len() / 2) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::VoiceSample;

    const RATE: u32 = 1000;

    fn buffer(secs: f64, level: f32) -> AudioBuffer {
        let frames = (secs * RATE as f64) as usize;
        AudioBuffer::new(Arc::new(vec![level; frames * 2]), RATE)
    }

    fn bank() -> VoiceBank {
        let mut bank = VoiceBank::new();
        for n in 1..=8 {
            bank.insert(n, VoiceSample::new(Arc::new(vec![0.3; 100]), RATE));
        }
        bank
    }

    fn stems(secs: f64) -> [AudioBuffer; 4] {
        [
            buffer(secs, 0.1),
            buffer(secs, 0.1),
            buffer(secs, 0.1),
            buffer(secs, 0.1),
        ]
    }

    #[test]
    fn test_render_advances_clock_and_position() {
        let mut state = RenderState::new(RATE, bank());
        state.load(buffer(2.0, 0.2), None);
        state.play();

        let mut out = vec![0.0; 200];
        state.render(&mut out);
        assert_eq!(state.clock(), 100);
        assert!((state.position() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_clock_runs_without_track() {
        let mut state = RenderState::new(RATE, bank());
        let mut out = vec![1.0; 64];
        state.render(&mut out);
        assert_eq!(state.clock(), 32);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_stems_move_together() {
        let mut state = RenderState::new(RATE, bank());
        state.load(buffer(4.0, 0.2), Some(stems(4.0)));
        assert!(state.set_stems_active(true));
        state.seek(1.5);
        state.play();

        let mut out = vec![0.0; 200];
        state.render(&mut out);

        let positions = state.stem_positions();
        assert_eq!(positions.len(), 4);
        assert!(positions.iter().all(|&p| (p - 1.6).abs() < 1e-9));
        assert!((state.position() - 1.6).abs() < 1e-9);
    }

    #[test]
    fn test_stems_requested_without_stems() {
        let mut state = RenderState::new(RATE, bank());
        state.load(buffer(1.0, 0.2), None);
        assert!(!state.set_stems_active(true));
        assert!(!state.stems_active());
    }

    #[test]
    fn test_load_cancels_voices() {
        let mut state = RenderState::new(RATE, bank());
        state.load(buffer(1.0, 0.2), None);
        assert!(state.schedule_voice(0, 1, 500));
        assert_eq!(state.scheduled_voices().len(), 1);

        state.load(buffer(1.0, 0.2), None);
        assert!(state.scheduled_voices().is_empty());
    }

    #[test]
    fn test_missing_voice_sample_not_scheduled() {
        let mut state = RenderState::new(RATE, VoiceBank::new());
        assert!(!state.schedule_voice(0, 1, 0));
        assert_eq!(state.voices_scheduled_total(), 0);
    }
}
