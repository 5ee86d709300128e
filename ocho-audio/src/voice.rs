//! Spoken count samples and the voices scheduled against the device clock

use std::sync::Arc;

/// One spoken number, decoded to interleaved stereo
#[derive(Debug, Clone)]
pub struct VoiceSample {
    pub samples: Arc<Vec<f32>>,
    pub sample_rate: u32,
}

impl VoiceSample {
    pub fn new(samples: Arc<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }
}

/// The eight spoken numbers of a count
#[derive(Debug, Clone, Default)]
pub struct VoiceBank {
    numbers: [Option<VoiceSample>; 8],
}

impl VoiceBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the sample for `number` (1..=8); other numbers are ignored
    pub fn insert(&mut self, number: u8, sample: VoiceSample) {
        if let Some(slot) = Self::slot(number) {
            self.numbers[slot] = Some(sample);
        }
    }

    pub fn get(&self, number: u8) -> Option<&VoiceSample> {
        Self::slot(number).and_then(|slot| self.numbers[slot].as_ref())
    }

    /// All eight numbers present
    pub fn is_complete(&self) -> bool {
        self.numbers.iter().all(|n| n.is_some())
    }

    pub fn missing(&self) -> Vec<u8> {
        (1..=8).filter(|&n| self.get(n).is_none()).collect()
    }

    fn slot(number: u8) -> Option<usize> {
        (1..=8).contains(&number).then(|| number as usize - 1)
    }
}

/// A voice registered to start at a device frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledVoice {
    pub beat_index: usize,
    pub beat_number: u8,
    /// Device frame at which the first sample plays
    pub start_frame: u64,
}

struct ActiveVoice {
    info: ScheduledVoice,
    sample: VoiceSample,
    step: f64,
    cursor: f64,
}

/// Pending and sounding voices, rendered sample-accurately
pub struct VoiceLayer {
    voices: Vec<ActiveVoice>,
    device_rate: u32,
    gain: f32,
    scheduled_total: usize,
}

impl VoiceLayer {
    pub fn new(device_rate: u32) -> Self {
        Self {
            voices: Vec::with_capacity(32),
            device_rate,
            gain: 1.0,
            scheduled_total: 0,
        }
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    pub fn schedule(&mut self, info: ScheduledVoice, sample: VoiceSample) {
        let step = if self.device_rate == 0 {
            1.0
        } else {
            sample.sample_rate as f64 / self.device_rate as f64
        };
        self.voices.push(ActiveVoice {
            info,
            sample,
            step,
            cursor: 0.0,
        });
        self.scheduled_total += 1;
    }

    /// Drop every pending and sounding voice, returning how many were dropped
    pub fn cancel_all(&mut self) -> usize {
        let dropped = self.voices.len();
        self.voices.clear();
        dropped
    }

    pub fn scheduled(&self) -> impl Iterator<Item = &ScheduledVoice> {
        self.voices.iter().map(|v| &v.info)
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// Voices registered since creation, including finished and cancelled ones
    pub fn scheduled_total(&self) -> usize {
        self.scheduled_total
    }

    /// Add voices into an interleaved stereo buffer whose first frame is `clock`
    pub fn render(&mut self, output: &mut [f32], clock: u64) {
        let frames = output.len() / 2;
        let buffer_end = clock + frames as u64;
        let gain = self.gain;

        self.voices.retain_mut(|voice| {
            if voice.info.start_frame >= buffer_end {
                return true;
            }

            let offset = voice.info.start_frame.saturating_sub(clock) as usize;
            let source = &voice.sample.samples;
            let source_frames = voice.sample.frames();

            for frame in output[offset * 2..].chunks_exact_mut(2) {
                let pos = voice.cursor as usize;
                if pos >= source_frames {
                    return false;
                }
                frame[0] += source[pos * 2] * gain;
                frame[1] += source[pos * 2 + 1] * gain;
                voice.cursor += voice.step;
            }

            (voice.cursor as usize) < source_frames
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(frames: usize) -> VoiceSample {
        VoiceSample::new(Arc::new(vec![0.5; frames * 2]), 1000)
    }

    fn voice(beat_index: usize, start_frame: u64) -> ScheduledVoice {
        ScheduledVoice {
            beat_index,
            beat_number: 1,
            start_frame,
        }
    }

    #[test]
    fn test_bank_completeness() {
        let mut bank = VoiceBank::new();
        for n in 1..=7 {
            bank.insert(n, sample(10));
        }
        assert!(!bank.is_complete());
        assert_eq!(bank.missing(), vec![8]);

        bank.insert(8, sample(10));
        bank.insert(9, sample(10));
        assert!(bank.is_complete());
        assert!(bank.get(0).is_none());
    }

    #[test]
    fn test_voice_starts_at_exact_frame() {
        let mut layer = VoiceLayer::new(1000);
        layer.schedule(voice(0, 105), sample(50));

        let mut out = vec![0.0; 200];
        layer.render(&mut out, 0);
        assert!(out.iter().all(|&s| s == 0.0), "voice must wait for its frame");

        let mut short = vec![0.0; 40];
        layer.render(&mut short, 100);
        assert!(short[..10].iter().all(|&s| s == 0.0));
        assert_eq!(short[10], 0.5);
        assert_eq!(layer.len(), 1);

        out.fill(0.0);
        layer.render(&mut out, 120);
        assert!(layer.is_empty(), "finished voices are dropped");
    }

    #[test]
    fn test_late_voice_starts_immediately() {
        let mut layer = VoiceLayer::new(1000);
        layer.schedule(voice(0, 10), sample(50));
        let mut out = vec![0.0; 40];
        layer.render(&mut out, 500);
        assert_eq!(out[0], 0.5);
    }

    #[test]
    fn test_cancel_all() {
        let mut layer = VoiceLayer::new(1000);
        layer.schedule(voice(0, 100), sample(50));
        layer.schedule(voice(1, 600), sample(50));
        assert_eq!(layer.cancel_all(), 2);
        assert!(layer.is_empty());
        assert_eq!(layer.scheduled_total(), 2);

        let mut out = vec![0.0; 2000];
        layer.render(&mut out, 0);
        assert!(out.iter().all(|&s| s == 0.0));
    }
}
