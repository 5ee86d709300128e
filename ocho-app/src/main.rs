//! OCHO - spoken 1-8 dance count played in lock-step with music
//!
//! `ocho grid` prints the beat grid an analysis report produces.
//! `ocho play` plays a track with its count, driven from the keyboard.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use ocho_analysis::{
    AnalysisReport, BeatGridBuilder, StructuralMetadata, TrackTiming, VoiceFilterMode,
    FALLBACK_BPM,
};
use ocho_audio::{
    AudioEngine, EngineCommand, EngineConfig, EngineEvent, MixSettings, StemKind, VoiceBank,
};
use ocho_library::{Config, TrackAssets, TrackLoader, VoicePack};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Seconds moved by the left/right keys
const SEEK_STEP: f64 = 5.0;
/// Key poll period of the control loop
const INPUT_POLL: Duration = Duration::from_millis(50);
/// How long to wait for the engine to open its output
const READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "ocho", version, about = "Spoken 1-8 dance count played with music")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the labeled beat grid for an analysis report
    Grid {
        /// Analyzer JSON report
        #[arg(long)]
        analysis: PathBuf,
        /// Track length in seconds (defaults to the report's duration)
        #[arg(long)]
        duration: Option<f64>,
    },
    /// Play a track with its spoken count
    Play {
        /// Mixed audio file
        mix: PathBuf,
        /// Analyzer JSON report
        #[arg(long)]
        analysis: Option<PathBuf>,
        /// Directory holding vocals/drums/bass/other stems
        #[arg(long)]
        stems: Option<PathBuf>,
        /// Voice pack directory holding 1..8 samples
        #[arg(long)]
        voices: Option<PathBuf>,
        /// Voice language sub-directory
        #[arg(long)]
        lang: Option<String>,
        /// mute, on1, on1and5, on1times3 or full
        #[arg(long)]
        mode: Option<VoiceFilterMode>,
        /// Tempo override
        #[arg(long)]
        bpm: Option<f64>,
        /// First beat override in seconds
        #[arg(long)]
        offset: Option<f64>,
        /// Keep --mode, --voices and --lang as the new defaults
        #[arg(long)]
        save: bool,
    },
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Grid { analysis, duration } => print_grid(&analysis, duration),
        Commands::Play {
            mix,
            analysis,
            stems,
            voices,
            lang,
            mode,
            bpm,
            offset,
            save,
        } => {
            let mut config = Config::load();
            apply_overrides(&mut config, mode, voices, lang);
            if save {
                config.save().context("failed to save preferences")?;
                info!(path = %Config::config_path().display(), "preferences saved");
            }

            let report = analysis
                .as_deref()
                .map(AnalysisReport::from_path)
                .transpose()
                .context("failed to read analysis report")?;

            play(PlayRequest {
                config,
                mix,
                stems,
                timing: resolve_timing(report.as_ref(), bpm, offset),
                structure: report.as_ref().map(AnalysisReport::structure),
            })
        }
    }
}

fn apply_overrides(
    config: &mut Config,
    mode: Option<VoiceFilterMode>,
    voices: Option<PathBuf>,
    lang: Option<String>,
) {
    if let Some(mode) = mode {
        config.filter_mode = mode;
    }
    if voices.is_some() {
        config.voices_dir = voices;
    }
    if lang.is_some() {
        config.voice_language = lang;
    }
}

/// Explicit flags win over the report, the report over the fallback tempo
fn resolve_timing(
    report: Option<&AnalysisReport>,
    bpm: Option<f64>,
    offset: Option<f64>,
) -> TrackTiming {
    let base = report
        .map(AnalysisReport::timing)
        .unwrap_or_else(|| TrackTiming::new(FALLBACK_BPM, 0.0));
    TrackTiming::new(bpm.unwrap_or(base.bpm), offset.unwrap_or(base.offset))
}

fn print_grid(analysis: &Path, duration: Option<f64>) -> Result<()> {
    let report = AnalysisReport::from_path(analysis)
        .with_context(|| format!("failed to read {}", analysis.display()))?;

    let Some(duration) = duration.or(report.duration) else {
        bail!("report has no duration, pass --duration");
    };

    let structure = report.structure();
    let grid = BeatGridBuilder::new().build(report.timing(), duration, Some(&structure));

    let mut out = io::stdout().lock();
    writeln!(
        out,
        "# {} beats, {:.3}s apart, {:?} labeling",
        grid.len(),
        grid.interval(),
        grid.labeling()
    )?;
    for (index, beat) in grid.iter().enumerate() {
        writeln!(
            out,
            "{:>5}  {:>9.3}  {}{}",
            index,
            beat.time,
            beat.number,
            if beat.is_bridge { "  bridge" } else { "" }
        )?;
    }
    Ok(())
}

struct PlayRequest {
    config: Config,
    mix: PathBuf,
    stems: Option<PathBuf>,
    timing: TrackTiming,
    structure: Option<StructuralMetadata>,
}

fn engine_config(config: &Config) -> EngineConfig {
    let mix = MixSettings {
        master_volume: config.master_volume,
        voice_volume: config.voice_volume,
        ..Default::default()
    };
    let look_ahead = if config.look_ahead_secs.is_finite() {
        config.look_ahead_secs.clamp(0.0, 60.0)
    } else {
        Config::default().look_ahead_secs
    };

    EngineConfig {
        tick_period: Duration::from_millis(config.tick_ms),
        look_ahead: Duration::from_secs_f64(look_ahead),
        filter_mode: config.filter_mode,
        mix: mix.clamped(),
        prefer_stems: config.prefer_stems,
        ..Default::default()
    }
}

fn load_voices(config: &Config) -> VoiceBank {
    match config.voices_dir.as_deref() {
        Some(dir) => VoicePack::load(&TrackLoader::new(), dir, config.voice_language.as_deref())
            .into_bank(),
        None => {
            warn!("no voice pack configured, the count will be silent");
            VoiceBank::new()
        }
    }
}

/// Wait for the engine's output rate, reporting any startup fallback
fn wait_ready(engine: &AudioEngine) -> Result<u32> {
    let deadline = Instant::now() + READY_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match engine.event_rx.recv_timeout(remaining) {
            Ok(EngineEvent::Ready {
                sample_rate,
                voicing,
            }) => {
                info!(sample_rate, voicing, "engine ready");
                return Ok(sample_rate);
            }
            Ok(other) => log_event(&other),
            Err(RecvTimeoutError::Timeout) => bail!("engine did not start in time"),
            Err(RecvTimeoutError::Disconnected) => bail!("engine stopped during startup"),
        }
    }
}

fn play(request: PlayRequest) -> Result<()> {
    let bank = load_voices(&request.config);
    let mut engine = AudioEngine::spawn(engine_config(&request.config), bank)
        .context("failed to start engine thread")?;
    let sample_rate = wait_ready(&engine)?;

    let loader = TrackLoader::with_sample_rate(sample_rate);
    let assets = TrackAssets::load(&loader, &request.mix, request.stems.as_deref())
        .with_context(|| format!("failed to load {}", request.mix.display()))?;

    engine.send(EngineCommand::LoadTrack(Box::new(
        assets.into_bundle(request.timing, request.structure),
    )));
    engine.send(EngineCommand::Play);

    println!("space play/pause  s stop  \u{2190}/\u{2192} seek  t stems  m mode  1-4 mute stem  q quit");

    enable_raw_mode()?;
    let result = run_controls(&engine);
    disable_raw_mode()?;

    engine.shutdown();
    result
}

fn run_controls(engine: &AudioEngine) -> Result<()> {
    let mut stems_enabled = [true; 4];

    loop {
        while let Ok(evt) = engine.event_rx.try_recv() {
            log_event(&evt);
        }
        if engine.is_shutdown() {
            return Ok(());
        }

        if !event::poll(INPUT_POLL)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        match control_for(key) {
            Some(Control::Quit) => return Ok(()),
            Some(Control::ToggleStem(kind)) => {
                let enabled = &mut stems_enabled[kind.index()];
                *enabled = !*enabled;
                engine.send(EngineCommand::SetStemEnabled(kind, *enabled));
            }
            Some(Control::Engine(cmd)) => engine.send(cmd),
            None => {}
        }
    }
}

enum Control {
    Engine(EngineCommand),
    ToggleStem(StemKind),
    Quit,
}

fn control_for(key: KeyEvent) -> Option<Control> {
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        return Some(Control::Quit);
    }

    let cmd = match key.code {
        KeyCode::Char(' ') => EngineCommand::TogglePlay,
        KeyCode::Char('s') => EngineCommand::Stop,
        KeyCode::Left => EngineCommand::Nudge(-SEEK_STEP),
        KeyCode::Right => EngineCommand::Nudge(SEEK_STEP),
        KeyCode::Char('t') => EngineCommand::ToggleStemsMode,
        KeyCode::Char('m') => EngineCommand::CycleFilterMode,
        KeyCode::Char('q') | KeyCode::Esc => return Some(Control::Quit),
        KeyCode::Char(c @ '1'..='4') => {
            let index = c as usize - '1' as usize;
            return Some(Control::ToggleStem(StemKind::ALL[index]));
        }
        _ => return None,
    };
    Some(Control::Engine(cmd))
}

fn log_event(evt: &EngineEvent) {
    match evt {
        EngineEvent::Ready { .. } | EngineEvent::TimeUpdate(_) => {}
        EngineEvent::TrackLoaded {
            name,
            duration,
            beats,
            stems,
        } => info!(
            name = name.as_deref().unwrap_or("untitled"),
            duration, beats, stems, "track loaded"
        ),
        EngineEvent::StateChanged(state) => info!(?state, "transport"),
        EngineEvent::BeatUpdate {
            number, is_bridge, ..
        } => {
            // Count line on stdout, logs stay on stderr
            print!("{}{}\r\n", number, if *is_bridge { " ~" } else { "" });
            let _ = io::stdout().flush();
        }
        EngineEvent::TrackEnded => info!("track ended"),
        EngineEvent::Degraded(fallback) => warn!(?fallback, "running degraded"),
        EngineEvent::Error(message) => warn!(%message, "engine error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEventState;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent {
            code,
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }
    }

    #[test]
    fn test_cli_parses_play() {
        let cli = Cli::try_parse_from([
            "ocho", "play", "song.mp3", "--mode", "on1and5", "--bpm", "96", "--lang", "es",
        ])
        .unwrap();
        match cli.command {
            Commands::Play {
                mix, mode, bpm, lang, ..
            } => {
                assert_eq!(mix, PathBuf::from("song.mp3"));
                assert_eq!(mode, Some(VoiceFilterMode::On1And5));
                assert_eq!(bpm, Some(96.0));
                assert_eq!(lang.as_deref(), Some("es"));
            }
            Commands::Grid { .. } => panic!("expected play"),
        }
    }

    #[test]
    fn test_overrides_keep_unset_preferences() {
        let mut config = Config {
            voices_dir: Some(PathBuf::from("/voices")),
            voice_language: Some("es".into()),
            ..Default::default()
        };
        apply_overrides(&mut config, Some(VoiceFilterMode::On1), None, Some("fr".into()));

        assert_eq!(config.filter_mode, VoiceFilterMode::On1);
        assert_eq!(config.voices_dir, Some(PathBuf::from("/voices")));
        assert_eq!(config.voice_language.as_deref(), Some("fr"));
    }

    #[test]
    fn test_cli_save_flag() {
        let cli = Cli::try_parse_from(["ocho", "play", "a.wav", "--save"]).unwrap();
        assert!(matches!(cli.command, Commands::Play { save: true, .. }));
        let cli = Cli::try_parse_from(["ocho", "play", "a.wav"]).unwrap();
        assert!(matches!(cli.command, Commands::Play { save: false, .. }));
    }

    #[test]
    fn test_cli_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["ocho", "play", "a.wav", "--mode", "loud"]).is_err());
    }

    #[test]
    fn test_timing_precedence() {
        let report = AnalysisReport::from_json(r#"{"bpm": 100.0, "offset": 0.4}"#).unwrap();

        let from_report = resolve_timing(Some(&report), None, None);
        assert_eq!((from_report.bpm, from_report.offset), (100.0, 0.4));

        let overridden = resolve_timing(Some(&report), Some(90.0), None);
        assert_eq!((overridden.bpm, overridden.offset), (90.0, 0.4));

        let fallback = resolve_timing(None, None, Some(1.0));
        assert_eq!((fallback.bpm, fallback.offset), (FALLBACK_BPM, 1.0));
    }

    #[test]
    fn test_engine_config_from_preferences() {
        let config = Config {
            master_volume: 5.0,
            voice_volume: 0.5,
            tick_ms: 10,
            ..Default::default()
        };
        let engine = engine_config(&config);
        assert_eq!(engine.tick_period, Duration::from_millis(10));
        assert_eq!(engine.mix.master_volume, 2.0);
        assert_eq!(engine.mix.voice_volume, 0.5);
        assert_eq!(engine.look_ahead, Duration::from_millis(1500));
    }

    #[test]
    fn test_key_bindings() {
        assert!(matches!(
            control_for(key(KeyCode::Char(' '))),
            Some(Control::Engine(EngineCommand::TogglePlay))
        ));
        assert!(matches!(
            control_for(key(KeyCode::Left)),
            Some(Control::Engine(EngineCommand::Nudge(d))) if d == -SEEK_STEP
        ));
        assert!(matches!(
            control_for(key(KeyCode::Char('3'))),
            Some(Control::ToggleStem(StemKind::Bass))
        ));
        assert!(matches!(control_for(key(KeyCode::Char('q'))), Some(Control::Quit)));
        assert!(control_for(key(KeyCode::Char('z'))).is_none());

        let ctrl_c = KeyEvent {
            modifiers: KeyModifiers::CONTROL,
            ..key(KeyCode::Char('c'))
        };
        assert!(matches!(control_for(ctrl_c), Some(Control::Quit)));
    }
}
