//! Strategies for turning due beats into scheduled voices
//!
//! The strategy is picked once when the engine starts: sample-accurate
//! look-ahead when the device has a clock and every voice sample decoded,
//! otherwise an immediate trigger from the catch-up pass.

use crate::render::RenderState;
use ocho_analysis::{BeatGrid, CursorSync, VoiceFilterMode};
use tracing::{debug, warn};

/// What a strategy may look at and touch during one pass
pub struct VoicingContext<'a> {
    pub grid: &'a BeatGrid,
    pub mode: VoiceFilterMode,
    /// Track position the pass was computed for
    pub position: f64,
    pub render: &'a mut RenderState,
}

impl VoicingContext<'_> {
    /// Device frame at which a beat at `time` sounds, never in the past
    pub fn start_frame(&self, time: f64) -> u64 {
        let rate = self.render.sample_rate() as f64;
        let lead = ((time - self.position) * rate).round().max(0.0) as u64;
        self.render.clock() + lead
    }
}

pub trait VoicingStrategy {
    fn name(&self) -> &'static str;

    /// Called by the catch-up pass for every beat it fires
    fn on_beat(&mut self, index: usize, ctx: &mut VoicingContext<'_>);

    /// Called once per tick while playing
    fn look_ahead(&mut self, ctx: &mut VoicingContext<'_>);

    /// Drop everything scheduled so far
    fn cancel(&mut self, render: &mut RenderState);
}

/// Schedules voices ahead of time against the device clock
pub struct LookAheadVoicing {
    horizon: f64,
    last_scheduled: Option<usize>,
}

impl LookAheadVoicing {
    pub fn new(horizon_secs: f64) -> Self {
        Self {
            horizon: horizon_secs,
            last_scheduled: None,
        }
    }

    pub fn last_scheduled(&self) -> Option<usize> {
        self.last_scheduled
    }
}

impl VoicingStrategy for LookAheadVoicing {
    fn name(&self) -> &'static str {
        "look-ahead"
    }

    fn on_beat(&mut self, _index: usize, _ctx: &mut VoicingContext<'_>) {}

    fn look_ahead(&mut self, ctx: &mut VoicingContext<'_>) {
        let horizon_end = ctx.position + self.horizon;
        let mut next = match self.last_scheduled {
            Some(index) => index + 1,
            None => CursorSync::locate(ctx.grid, ctx.position),
        };

        while let Some(event) = ctx.grid.get(next) {
            if event.time > horizon_end {
                break;
            }
            if ctx.mode.should_voice(event.number) {
                let start_frame = ctx.start_frame(event.time);
                if ctx.render.schedule_voice(next, event.number, start_frame) {
                    debug!(beat = next, number = event.number, start_frame, "voice scheduled");
                }
            }
            self.last_scheduled = Some(next);
            next += 1;
        }
    }

    fn cancel(&mut self, render: &mut RenderState) {
        render.cancel_voices();
        self.last_scheduled = None;
    }
}

/// Triggers the voice when the catch-up pass fires the beat
#[derive(Default)]
pub struct ImmediateVoicing;

impl VoicingStrategy for ImmediateVoicing {
    fn name(&self) -> &'static str {
        "immediate"
    }

    fn on_beat(&mut self, index: usize, ctx: &mut VoicingContext<'_>) {
        let Some(event) = ctx.grid.get(index) else {
            return;
        };
        if ctx.mode.should_voice(event.number) {
            // Beats fired early by the speculative window still land on time
            let start_frame = ctx.start_frame(event.time);
            ctx.render.schedule_voice(index, event.number, start_frame);
        }
    }

    fn look_ahead(&mut self, _ctx: &mut VoicingContext<'_>) {}

    fn cancel(&mut self, render: &mut RenderState) {
        render.cancel_voices();
    }
}

/// Pick the voicing strategy for this session
pub fn select_voicing(
    has_clock: bool,
    bank_complete: bool,
    horizon_secs: f64,
) -> Box<dyn VoicingStrategy> {
    if has_clock && bank_complete {
        Box::new(LookAheadVoicing::new(horizon_secs))
    } else {
        warn!(has_clock, bank_complete, "falling back to immediate voice triggering");
        Box::new(ImmediateVoicing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::{VoiceBank, VoiceSample};
    use ocho_analysis::{BeatGridBuilder, TrackTiming};
    use std::sync::Arc;

    fn render() -> RenderState {
        let mut bank = VoiceBank::new();
        for n in 1..=8 {
            bank.insert(n, VoiceSample::new(Arc::new(vec![0.1; 20]), 1000));
        }
        RenderState::new(1000, bank)
    }

    fn grid() -> BeatGrid {
        BeatGridBuilder::new().build(TrackTiming::new(120.0, 0.0), 20.0, None)
    }

    #[test]
    fn test_look_ahead_schedules_horizon_once() {
        let grid = grid();
        let mut render = render();
        let mut voicing = LookAheadVoicing::new(1.5);

        for _ in 0..3 {
            let mut ctx = VoicingContext {
                grid: &grid,
                mode: VoiceFilterMode::Full,
                position: 0.2,
                render: &mut render,
            };
            voicing.look_ahead(&mut ctx);
        }

        // beats at 0.5, 1.0 and 1.5
        let voices = render.scheduled_voices();
        let indices: Vec<_> = voices.iter().map(|v| v.beat_index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(voices[0].start_frame, 300);
        assert_eq!(voicing.last_scheduled(), Some(3));
    }

    #[test]
    fn test_look_ahead_respects_filter() {
        let grid = grid();
        let mut render = render();
        let mut voicing = LookAheadVoicing::new(4.0);
        let mut ctx = VoicingContext {
            grid: &grid,
            mode: VoiceFilterMode::On1And5,
            position: 0.0,
            render: &mut render,
        };
        voicing.look_ahead(&mut ctx);

        let numbers: Vec<_> = render.scheduled_voices().iter().map(|v| v.beat_number).collect();
        assert_eq!(numbers, vec![1, 5, 1]);
    }

    #[test]
    fn test_cancel_restarts_from_position() {
        let grid = grid();
        let mut render = render();
        let mut voicing = LookAheadVoicing::new(1.0);
        let mut ctx = VoicingContext {
            grid: &grid,
            mode: VoiceFilterMode::Full,
            position: 0.0,
            render: &mut render,
        };
        voicing.look_ahead(&mut ctx);
        voicing.cancel(&mut render);
        assert!(render.scheduled_voices().is_empty());
        assert_eq!(voicing.last_scheduled(), None);

        let mut ctx = VoicingContext {
            grid: &grid,
            mode: VoiceFilterMode::Full,
            position: 10.1,
            render: &mut render,
        };
        voicing.look_ahead(&mut ctx);
        let indices: Vec<_> = render.scheduled_voices().iter().map(|v| v.beat_index).collect();
        assert_eq!(indices, vec![21, 22]);
    }

    #[test]
    fn test_immediate_triggers_at_clock() {
        let grid = grid();
        let mut render = render();
        let mut voicing = ImmediateVoicing;
        let mut ctx = VoicingContext {
            grid: &grid,
            mode: VoiceFilterMode::On1,
            position: 0.0,
            render: &mut render,
        };
        voicing.on_beat(0, &mut ctx);
        voicing.on_beat(1, &mut ctx);
        voicing.look_ahead(&mut ctx);

        let voices = render.scheduled_voices();
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].beat_number, 1);
        assert_eq!(voices[0].start_frame, 0);
    }

    #[test]
    fn test_immediate_keeps_early_beat_on_time() {
        let grid = grid();
        let mut render = render();
        let mut voicing = ImmediateVoicing;
        let mut ctx = VoicingContext {
            grid: &grid,
            mode: VoiceFilterMode::Full,
            position: 1.46,
            render: &mut render,
        };
        // beat 3 sits at 1.5 s, 40 ms ahead of the playhead
        voicing.on_beat(3, &mut ctx);
        // beat 2 is already behind it and sounds at once
        voicing.on_beat(2, &mut ctx);

        let starts: Vec<_> = render
            .scheduled_voices()
            .iter()
            .map(|v| (v.beat_index, v.start_frame))
            .collect();
        assert_eq!(starts, vec![(3, 40), (2, 0)]);
    }

    #[test]
    fn test_selection() {
        assert_eq!(select_voicing(true, true, 1.5).name(), "look-ahead");
        assert_eq!(select_voicing(false, true, 1.5).name(), "immediate");
        assert_eq!(select_voicing(true, false, 1.5).name(), "immediate");
    }
}
