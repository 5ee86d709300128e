//! Audio engine - command/event plumbing and the engine thread

use crate::mixer::{MixSettings, StemKind};
use crate::output::{CpalOutput, NullOutput, OutputDevice};
use crate::render::{AudioBuffer, RenderState, SharedRenderState};
use crate::scheduler::{PlaybackScheduler, TransportState};
use crate::voice::VoiceBank;
use crate::voicing::select_voicing;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ocho_analysis::{StructuralMetadata, TrackTiming, VoiceFilterMode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Everything needed to play one track
#[derive(Debug, Clone)]
pub struct TrackBundle {
    pub name: Option<String>,
    pub mix: AudioBuffer,
    /// Vocals, drums, bass, other
    pub stems: Option<[AudioBuffer; 4]>,
    pub timing: TrackTiming,
    pub structure: Option<StructuralMetadata>,
}

/// Commands sent to the engine thread
#[derive(Debug, Clone)]
pub enum EngineCommand {
    // Boxed to keep the channel slots small
    LoadTrack(Box<TrackBundle>),
    Play,
    Pause,
    TogglePlay,
    Stop,
    Seek(f64),
    Nudge(f64),
    SetStemsMode(bool),
    ToggleStemsMode,
    SetStemEnabled(StemKind, bool),
    SetFilterMode(VoiceFilterMode),
    CycleFilterMode,
    SetMix(MixSettings),
    Shutdown,
}

/// A degraded mode the engine switched to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Stems missing or incomplete, the single file plays instead
    SingleFileInsteadOfStems,
    /// Voices trigger when their beat fires instead of ahead of time
    ImmediateVoicing,
    /// No output device, the track advances silently
    SilentOutput,
}

/// Events sent from the engine thread
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Ready {
        sample_rate: u32,
        voicing: &'static str,
    },
    TrackLoaded {
        name: Option<String>,
        duration: f64,
        beats: usize,
        stems: bool,
    },
    StateChanged(TransportState),
    /// Current master position in seconds
    TimeUpdate(f64),
    BeatUpdate {
        index: usize,
        number: u8,
        time: f64,
        is_bridge: bool,
    },
    TrackEnded,
    Degraded(Fallback),
    Error(String),
}

/// Engine timing and startup settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of the scheduling timer
    pub tick_period: Duration,
    /// How far ahead voices are scheduled
    pub look_ahead: Duration,
    /// How early a beat may be announced
    pub speculative_window: Duration,
    /// Render rate when no device can be opened
    pub fallback_sample_rate: u32,
    pub filter_mode: VoiceFilterMode,
    pub mix: MixSettings,
    pub prefer_stems: bool,
}

impl EngineConfig {
    pub const DEFAULT_TICK: Duration = Duration::from_millis(20);
    pub const MAX_TICK: Duration = Duration::from_millis(20);
    pub const MIN_LOOK_AHEAD: Duration = Duration::from_millis(250);

    /// Keep the timer fast enough and the horizon wider than a few ticks,
    /// so a late tick never leaves a due voice unscheduled
    pub fn validated(mut self) -> Self {
        if self.tick_period.is_zero() {
            self.tick_period = Self::DEFAULT_TICK;
        }
        if self.tick_period > Self::MAX_TICK {
            warn!(tick = ?self.tick_period, max = ?Self::MAX_TICK, "tick period too long, clamping");
            self.tick_period = Self::MAX_TICK;
        }
        let min_horizon = (self.tick_period * 4).max(Self::MIN_LOOK_AHEAD);
        if self.look_ahead < min_horizon {
            warn!(look_ahead = ?self.look_ahead, min = ?min_horizon, "look-ahead too short, widening");
            self.look_ahead = min_horizon;
        }
        if self.fallback_sample_rate == 0 {
            self.fallback_sample_rate = 48000;
        }
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_period: Self::DEFAULT_TICK,
            look_ahead: Duration::from_millis(1500),
            speculative_window: Duration::from_millis(50),
            fallback_sample_rate: 48000,
            filter_mode: VoiceFilterMode::default(),
            mix: MixSettings::default(),
            prefer_stems: false,
        }
    }
}

/// Poll interval while nothing is playing
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Engine thread body: opens the output, then serves commands and ticks
/// the scheduler until shutdown
pub fn run_engine(
    config: EngineConfig,
    bank: VoiceBank,
    commands: Receiver<EngineCommand>,
    events: Sender<EngineEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let config = config.validated();
    let bank_complete = bank.is_complete();
    if !bank_complete {
        warn!(missing = ?bank.missing(), "voice pack incomplete");
    }

    let (device, render): (Box<dyn OutputDevice>, SharedRenderState) =
        match CpalOutput::open(bank.clone()) {
            Ok((output, render)) => (Box::new(output) as Box<dyn OutputDevice>, render),
            Err(e) => {
                warn!(error = %e, "no audio output, continuing silently");
                let _ = events.try_send(EngineEvent::Degraded(Fallback::SilentOutput));
                let render = RenderState::new(config.fallback_sample_rate, bank).into_shared();
                (
                    Box::new(NullOutput::new(SharedRenderState::clone(&render))) as Box<dyn OutputDevice>,
                    render,
                )
            }
        };

    let sample_rate = device.sample_rate();
    let voicing = select_voicing(
        device.has_clock(),
        bank_complete,
        config.look_ahead.as_secs_f64(),
    );
    if voicing.name() != "look-ahead" {
        let _ = events.try_send(EngineEvent::Degraded(Fallback::ImmediateVoicing));
    }
    info!(sample_rate, voicing = voicing.name(), "engine ready");
    let _ = events.try_send(EngineEvent::Ready {
        sample_rate,
        voicing: voicing.name(),
    });

    let mut scheduler = PlaybackScheduler::new(&config, render, device, voicing, events);

    let mut last_tick = Instant::now();
    let mut was_running = false;

    while !shutdown.load(Ordering::Relaxed) {
        let timeout = if scheduler.is_timer_running() {
            config.tick_period.saturating_sub(last_tick.elapsed())
        } else {
            IDLE_POLL
        };

        match commands.recv_timeout(timeout) {
            Ok(EngineCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(cmd) => scheduler.handle_command(cmd),
            Err(RecvTimeoutError::Timeout) => {}
        }

        let elapsed = last_tick.elapsed();
        if elapsed < config.tick_period {
            continue;
        }
        last_tick = Instant::now();
        scheduler.pump_output(elapsed);

        let running = scheduler.is_timer_running();
        if running && was_running && elapsed > config.look_ahead {
            warn!(gap = ?elapsed, horizon = ?config.look_ahead, "scheduler tick starved, voices may be late");
        }
        scheduler.tick();
        was_running = running;
    }

    scheduler.shutdown();
    info!("engine stopped");
}

/// Handle to communicate with the engine thread
pub struct AudioEngine {
    /// Send commands to the engine thread
    pub command_tx: Sender<EngineCommand>,
    /// Receive events from the engine thread
    pub event_rx: Receiver<EngineEvent>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioEngine {
    /// Create channels for engine communication
    /// Buffer size of 1024 provides headroom for command bursts without saturation
    pub fn create_channels() -> (
        Sender<EngineCommand>,
        Receiver<EngineCommand>,
        Sender<EngineEvent>,
        Receiver<EngineEvent>,
    ) {
        let (cmd_tx, cmd_rx) = bounded(1024);
        let (evt_tx, evt_rx) = bounded(1024);
        (cmd_tx, cmd_rx, evt_tx, evt_rx)
    }

    /// Start the engine thread
    pub fn spawn(config: EngineConfig, bank: VoiceBank) -> std::io::Result<Self> {
        let (command_tx, command_rx, event_tx, event_rx) = Self::create_channels();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = Arc::clone(&shutdown);

        let thread = std::thread::Builder::new()
            .name("ocho-engine".into())
            .spawn(move || run_engine(config, bank, command_rx, event_tx, shutdown_for_thread))?;

        Ok(Self {
            command_tx,
            event_rx,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Send a command to the engine
    pub fn send(&self, cmd: EngineCommand) {
        if self.command_tx.try_send(cmd).is_err() {
            warn!("engine command queue full, command dropped");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Request shutdown and wait for the engine thread
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.command_tx.try_send(EngineCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("engine thread panicked");
            }
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
