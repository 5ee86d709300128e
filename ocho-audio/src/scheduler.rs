//! Playback scheduler - transport state, catch-up pass and voice look-ahead
//!
//! Runs on the engine thread. Every tick it reads the master playhead,
//! announces the beats that are due (plus a small speculative window so the
//! display never lags the music) and asks the voicing strategy to cover the
//! look-ahead horizon. All transport changes cancel pending voices first.

use crate::engine::{EngineCommand, EngineConfig, EngineEvent, Fallback, TrackBundle};
use crate::error::EngineError;
use crate::mixer::{MixSettings, StemKind};
use crate::output::OutputDevice;
use crate::render::{RenderState, SharedRenderState};
use crate::voicing::{VoicingContext, VoicingStrategy};
use crossbeam_channel::{Sender, TrySendError};
use ocho_analysis::{BeatGrid, BeatGridBuilder, CursorSync, VoiceFilterMode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Transport state of the loaded track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Unloaded,
    Loaded,
    Playing,
    Paused,
    Ended,
}

/// Mutable playback state owned by the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub transport: TransportState,
    /// Index of the next beat to announce
    pub cursor: usize,
    pub filter_mode: VoiceFilterMode,
    pub mix: MixSettings,
    /// Play the stem set instead of the single file when one is loaded
    pub prefer_stems: bool,
}

/// Point-in-time view for display and tests
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSnapshot {
    pub transport: TransportState,
    pub position: f64,
    pub duration: f64,
    pub cursor: usize,
    pub beats: usize,
    pub has_stems: bool,
    pub stems_active: bool,
    pub filter_mode: VoiceFilterMode,
    pub voicing: &'static str,
    pub track_name: Option<String>,
}

pub struct PlaybackScheduler {
    render: SharedRenderState,
    device: Box<dyn OutputDevice>,
    voicing: Box<dyn VoicingStrategy>,
    events: Sender<EngineEvent>,
    builder: BeatGridBuilder,
    speculative_window: f64,
    grid: BeatGrid,
    state: PlaybackState,
    track_name: Option<String>,
}

impl PlaybackScheduler {
    pub fn new(
        config: &EngineConfig,
        render: SharedRenderState,
        device: Box<dyn OutputDevice>,
        voicing: Box<dyn VoicingStrategy>,
        events: Sender<EngineEvent>,
    ) -> Self {
        render.lock().set_mix(config.mix);
        Self {
            render,
            device,
            voicing,
            events,
            builder: BeatGridBuilder::new(),
            speculative_window: config.speculative_window.as_secs_f64(),
            grid: BeatGrid::empty(),
            state: PlaybackState {
                transport: TransportState::Unloaded,
                cursor: 0,
                filter_mode: config.filter_mode,
                mix: config.mix.clamped(),
                prefer_stems: config.prefer_stems,
            },
            track_name: None,
        }
    }

    fn emit(&self, event: EngineEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!(?event, "event queue full, notification dropped"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn set_transport(&mut self, transport: TransportState) {
        if self.state.transport != transport {
            debug!(from = ?self.state.transport, to = ?transport, "transport");
            self.state.transport = transport;
            self.emit(EngineEvent::StateChanged(transport));
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn grid(&self) -> &BeatGrid {
        &self.grid
    }

    pub fn render_state(&self) -> &SharedRenderState {
        &self.render
    }

    /// Whether the control loop should keep ticking
    pub fn is_timer_running(&self) -> bool {
        self.state.transport == TransportState::Playing
    }

    /// Give wall time to devices that are driven from the control loop
    pub fn pump_output(&mut self, elapsed: Duration) {
        self.device.pump(elapsed);
    }

    /// Handle a command from the control side
    pub fn handle_command(&mut self, cmd: EngineCommand) {
        let result = match cmd {
            EngineCommand::LoadTrack(bundle) => self.load_track(*bundle),
            EngineCommand::Play => self.play(),
            EngineCommand::Pause => self.pause(),
            EngineCommand::TogglePlay => self.toggle(),
            EngineCommand::Stop => self.stop(),
            EngineCommand::Seek(time) => self.seek(time),
            EngineCommand::Nudge(delta) => self.nudge(delta),
            EngineCommand::SetStemsMode(enabled) => self.set_stems_mode(enabled),
            EngineCommand::ToggleStemsMode => self.set_stems_mode(!self.state.prefer_stems),
            EngineCommand::SetStemEnabled(kind, enabled) => {
                self.set_stem_enabled(kind, enabled);
                Ok(())
            }
            EngineCommand::SetFilterMode(mode) => {
                self.set_filter_mode(mode);
                Ok(())
            }
            EngineCommand::CycleFilterMode => {
                self.set_filter_mode(self.state.filter_mode.cycle());
                Ok(())
            }
            EngineCommand::SetMix(settings) => {
                self.set_mix(settings);
                Ok(())
            }
            EngineCommand::Shutdown => {
                self.shutdown();
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "command rejected");
            self.emit(EngineEvent::Error(e.to_string()));
        }
    }

    /// Replace the current track, tearing down the previous one
    pub fn load_track(&mut self, bundle: TrackBundle) -> Result<(), EngineError> {
        let shared = Arc::clone(&self.render);
        let mut render = shared.lock();

        self.voicing.cancel(&mut render);
        render.load(bundle.mix, bundle.stems);

        if !render.is_loaded() {
            render.unload();
            drop(render);
            self.grid = BeatGrid::empty();
            self.state.cursor = 0;
            self.set_transport(TransportState::Unloaded);
            return Err(EngineError::MissingAsset("track contains no audio".into()));
        }

        render.set_mix(self.state.mix);
        let has_stems = render.has_stems();
        let stems_active = self.state.prefer_stems && render.set_stems_active(true);
        let duration = render.duration();
        drop(render);

        if self.state.prefer_stems && !stems_active {
            warn!("stems requested but not available, playing the single file");
            self.emit(EngineEvent::Degraded(Fallback::SingleFileInsteadOfStems));
        }

        self.grid = self
            .builder
            .build(bundle.timing, duration, bundle.structure.as_ref());
        self.state.cursor = 0;
        self.track_name = bundle.name;

        info!(
            name = ?self.track_name,
            duration,
            beats = self.grid.len(),
            labeling = ?self.grid.labeling(),
            stems = has_stems,
            "track loaded"
        );
        self.emit(EngineEvent::TrackLoaded {
            name: self.track_name.clone(),
            duration,
            beats: self.grid.len(),
            stems: has_stems,
        });

        // Force a StateChanged even when replacing an already loaded track
        self.state.transport = TransportState::Unloaded;
        self.set_transport(TransportState::Loaded);
        Ok(())
    }

    pub fn play(&mut self) -> Result<(), EngineError> {
        match self.state.transport {
            TransportState::Unloaded => return Err(EngineError::NoTrackLoaded),
            TransportState::Playing => return Ok(()),
            TransportState::Ended => {
                let shared = Arc::clone(&self.render);
                let mut render = shared.lock();
                render.stop();
                self.state.cursor = 0;
            }
            TransportState::Loaded | TransportState::Paused => {}
        }

        if !self.device.is_running() {
            self.device.resume()?;
            info!("audio device resumed");
        }

        // Intent first, so a tick racing with a slow device start still sees it
        self.set_transport(TransportState::Playing);
        {
            let shared = Arc::clone(&self.render);
            let mut render = shared.lock();
            let position = render.position();
            let resumed = CursorSync::resume(&self.grid, self.state.cursor, position);

            // Beats announced ahead of the playhead lost their voices to the
            // last cancellation, give them back without announcing them twice
            for index in CursorSync::locate(&self.grid, position)..resumed {
                let mut ctx = VoicingContext {
                    grid: &self.grid,
                    mode: self.state.filter_mode,
                    position,
                    render: &mut *render,
                };
                self.voicing.on_beat(index, &mut ctx);
            }

            self.state.cursor = resumed;
            render.play();
        }

        self.tick();
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), EngineError> {
        match self.state.transport {
            TransportState::Unloaded => Err(EngineError::NoTrackLoaded),
            TransportState::Playing => {
                self.set_transport(TransportState::Paused);
                let shared = Arc::clone(&self.render);
                let mut render = shared.lock();
                self.voicing.cancel(&mut render);
                render.pause();
                Ok(())
            }
            TransportState::Paused => Ok(()),
            state @ (TransportState::Loaded | TransportState::Ended) => {
                Err(EngineError::InvalidTransition {
                    action: "pause",
                    state,
                })
            }
        }
    }

    pub fn toggle(&mut self) -> Result<(), EngineError> {
        if self.state.transport == TransportState::Playing {
            self.pause()
        } else {
            self.play()
        }
    }

    /// Stop and return to the start of the track
    pub fn stop(&mut self) -> Result<(), EngineError> {
        if self.state.transport == TransportState::Unloaded {
            return Err(EngineError::NoTrackLoaded);
        }
        {
            let shared = Arc::clone(&self.render);
            let mut render = shared.lock();
            self.voicing.cancel(&mut render);
            render.stop();
        }
        self.state.cursor = 0;
        self.set_transport(TransportState::Loaded);
        self.emit(EngineEvent::TimeUpdate(0.0));
        Ok(())
    }

    /// Jump to `time` seconds, clamped to the track
    pub fn seek(&mut self, time: f64) -> Result<(), EngineError> {
        if self.state.transport == TransportState::Unloaded {
            return Err(EngineError::NoTrackLoaded);
        }
        let playing = self.state.transport == TransportState::Playing;

        let shared = Arc::clone(&self.render);
        let mut render = shared.lock();

        self.voicing.cancel(&mut render);
        let target = if time.is_finite() {
            time.clamp(0.0, render.duration())
        } else {
            0.0
        };
        render.seek(target);
        if playing {
            render.play();
        }

        self.state.cursor = CursorSync::locate(&self.grid, target);
        debug!(target, cursor = self.state.cursor, "seek");
        self.emit(EngineEvent::TimeUpdate(target));

        self.catch_up(&mut render, target, playing);
        if playing && self.device.is_running() {
            let mut ctx = VoicingContext {
                grid: &self.grid,
                mode: self.state.filter_mode,
                position: target,
                render: &mut *render,
            };
            self.voicing.look_ahead(&mut ctx);
        }
        drop(render);

        if self.state.transport == TransportState::Ended {
            self.set_transport(TransportState::Paused);
        }
        Ok(())
    }

    /// Seek relative to the current position
    pub fn nudge(&mut self, delta_secs: f64) -> Result<(), EngineError> {
        let position = self.render.lock().position();
        self.seek(position + delta_secs)
    }

    /// One scheduling pass. No-op unless playing.
    pub fn tick(&mut self) {
        if self.state.transport != TransportState::Playing {
            return;
        }

        let shared = Arc::clone(&self.render);
        let mut render = shared.lock();
        let position = render.position();
        self.emit(EngineEvent::TimeUpdate(position));

        self.catch_up(&mut render, position, true);

        if render.master_ended() {
            self.voicing.cancel(&mut render);
            drop(render);
            info!(position, "track ended");
            self.set_transport(TransportState::Ended);
            self.emit(EngineEvent::TrackEnded);
            return;
        }

        if self.device.is_running() {
            let mut ctx = VoicingContext {
                grid: &self.grid,
                mode: self.state.filter_mode,
                position,
                render: &mut *render,
            };
            self.voicing.look_ahead(&mut ctx);
        }
    }

    /// Announce every beat up to `position` plus the speculative window
    fn catch_up(&mut self, render: &mut RenderState, position: f64, voice: bool) {
        let fire_until = position + self.speculative_window;

        while let Some(event) = self.grid.get(self.state.cursor).copied() {
            if event.time > fire_until {
                break;
            }
            let index = self.state.cursor;
            self.emit(EngineEvent::BeatUpdate {
                index,
                number: event.number,
                time: event.time,
                is_bridge: event.is_bridge,
            });
            if voice {
                let mut ctx = VoicingContext {
                    grid: &self.grid,
                    mode: self.state.filter_mode,
                    position,
                    render: &mut *render,
                };
                self.voicing.on_beat(index, &mut ctx);
            }
            self.state.cursor += 1;
        }
    }

    /// Switch between the single file and the stem set, keeping position
    /// and resuming only if playback was active
    pub fn set_stems_mode(&mut self, enabled: bool) -> Result<(), EngineError> {
        self.state.prefer_stems = enabled;
        if self.state.transport == TransportState::Unloaded {
            return Ok(());
        }

        let shared = Arc::clone(&self.render);
        let mut render = shared.lock();

        if enabled && !render.has_stems() {
            drop(render);
            warn!("no stems loaded for this track, staying on the single file");
            self.emit(EngineEvent::Degraded(Fallback::SingleFileInsteadOfStems));
            return Ok(());
        }
        if enabled == render.stems_active() {
            return Ok(());
        }

        let was_playing = self.state.transport == TransportState::Playing;
        let position = render.position();

        self.voicing.cancel(&mut render);
        render.set_stems_active(enabled);
        render.seek(position);

        if was_playing {
            render.play();
            if self.device.is_running() {
                let mut ctx = VoicingContext {
                    grid: &self.grid,
                    mode: self.state.filter_mode,
                    position,
                    render: &mut *render,
                };
                self.voicing.look_ahead(&mut ctx);
            }
        }
        info!(stems = enabled, position, "playback source switched");
        Ok(())
    }

    pub fn set_filter_mode(&mut self, mode: VoiceFilterMode) {
        self.state.filter_mode = mode;
        info!(%mode, "voice filter");

        let shared = Arc::clone(&self.render);
        let mut render = shared.lock();
        self.voicing.cancel(&mut render);

        if self.state.transport == TransportState::Playing && self.device.is_running() {
            let position = render.position();
            let mut ctx = VoicingContext {
                grid: &self.grid,
                mode,
                position,
                render: &mut *render,
            };
            self.voicing.look_ahead(&mut ctx);
        }
    }

    pub fn set_mix(&mut self, settings: MixSettings) {
        self.state.mix = settings.clamped();
        self.render.lock().set_mix(self.state.mix);
    }

    pub fn set_stem_enabled(&mut self, kind: StemKind, enabled: bool) {
        self.state.mix.stem_mut(kind).enabled = enabled;
        self.render.lock().set_mix(self.state.mix);
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let render = self.render.lock();
        PlaybackSnapshot {
            transport: self.state.transport,
            position: render.position(),
            duration: render.duration(),
            cursor: self.state.cursor,
            beats: self.grid.len(),
            has_stems: render.has_stems(),
            stems_active: render.stems_active(),
            filter_mode: self.state.filter_mode,
            voicing: self.voicing.name(),
            track_name: self.track_name.clone(),
        }
    }

    /// Silence everything before the engine thread exits
    pub fn shutdown(&mut self) {
        {
            let shared = Arc::clone(&self.render);
            let mut render = shared.lock();
            self.voicing.cancel(&mut render);
            render.stop();
        }
        self.device.suspend();
    }
}
