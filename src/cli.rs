//! Terminal front end: loads settings and a story, waits for the start
//! gesture, then drives one session from single-letter commands.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use log::{info, warn};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    time::{self, MissedTickBehavior},
};

use crate::{
    audio::PlaybackDevice,
    error::SynthesisError,
    history::InMemoryHistory,
    models::{SessionPhase, SessionState, Story},
    session::{SessionController, SessionServices},
    settings::{PlaybackMode, PlaybackSettings, SessionConfig, SettingsStore},
    story_source::{obtain_story, JsonStoryFile, StorySource},
    synthesis::{AudioRef, HttpSynthesisClient, SynthesisClient, SynthesisRequest},
    telemetry::{FileTelemetrySink, LogTelemetrySink, TelemetrySink},
};

#[derive(Parser, Debug)]
#[command(name = "brushtales")]
#[command(about = "Narrated two-minute toothbrushing stories")]
#[command(version)]
pub struct CliArgs {
    /// JSON settings file (created on first save)
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Story JSON as produced by the story generator
    #[arg(long)]
    pub story: Option<PathBuf>,

    /// Names of the story's characters, e.g. "Arlo and Luna"
    #[arg(long, default_value = "")]
    pub characters: String,

    #[arg(long, default_value = "")]
    pub theme: String,

    /// Speech synthesis endpoint. Without it narration is off.
    #[arg(long)]
    pub synthesis_url: Option<String>,

    #[arg(long, env = "BRUSHTALES_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Append telemetry events to this JSON file instead of the log
    #[arg(long)]
    pub telemetry: Option<PathBuf>,

    #[arg(long)]
    pub voice: Option<String>,

    #[arg(long)]
    pub no_narration: bool,

    #[arg(long)]
    pub duration_ms: Option<u64>,

    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Play,
    Pause,
    Stop,
    Favorite,
    Hidden,
    Visible,
    Dismiss,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "p" | "play" => Some(Command::Play),
            "z" | "pause" => Some(Command::Pause),
            "s" | "stop" => Some(Command::Stop),
            "f" | "fav" | "favorite" => Some(Command::Favorite),
            "h" | "hide" | "hidden" => Some(Command::Hidden),
            "v" | "show" | "visible" => Some(Command::Visible),
            "d" | "dismiss" => Some(Command::Dismiss),
            "q" | "quit" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

const HELP: &str = "commands: p play | z pause | s stop | f favorite | h hidden | v visible | d dismiss | q quit";

/// Stand-in when no synthesis endpoint is configured.
struct NoSynthesis;

#[async_trait]
impl SynthesisClient for NoSynthesis {
    async fn synthesize(&self, _request: &SynthesisRequest) -> Result<AudioRef, SynthesisError> {
        Err(SynthesisError::Provider(
            "no speech service configured".into(),
        ))
    }
}

fn load_settings(args: &CliArgs) -> Result<(PlaybackSettings, SessionConfig)> {
    let (mut playback, mut config) = match &args.settings {
        Some(path) => {
            let store = SettingsStore::new(path.clone())?;
            (store.playback(), store.session_config())
        }
        None => (PlaybackSettings::default(), SessionConfig::default()),
    };

    if let Some(voice) = &args.voice {
        playback.voice_id = voice.clone();
    }
    if args.no_narration {
        playback.auto_play = false;
    }
    if let Some(duration_ms) = args.duration_ms {
        config.total_duration_ms = duration_ms;
    }
    config.validate().context("invalid session configuration")?;
    Ok((playback, config))
}

fn playback_device() -> Arc<dyn PlaybackDevice> {
    #[cfg(feature = "speaker")]
    {
        Arc::new(crate::audio::RodioDevice::new())
    }
    #[cfg(not(feature = "speaker"))]
    {
        // Roughly 128kbit/s MP3.
        Arc::new(crate::audio::SimulatedDevice::new(
            crate::audio::ClipLength::ByteRate(16_000),
        ))
    }
}

fn describe(state: &SessionState) -> String {
    let seconds = state.timer.remaining_ms.div_ceil(1_000);
    let mut line = format!(
        "[{}] segment {}/4  {}:{:02}",
        state.phase.as_str(),
        state.current_segment_index + 1,
        seconds / 60,
        seconds % 60
    );
    if state.is_paused {
        line.push_str("  (paused)");
    }
    line
}

/// Prints whatever changed enough to be worth a line.
fn report(previous: &SessionState, current: &SessionState) {
    let second_bucket = |state: &SessionState| state.timer.remaining_ms.div_ceil(1_000) / 10;
    if previous.phase != current.phase
        || previous.current_segment_index != current.current_segment_index
        || previous.is_paused != current.is_paused
        || second_bucket(previous) != second_bucket(current)
    {
        println!("{}", describe(current));
    }
    if current.notice.is_some() && previous.notice != current.notice {
        println!("! {}", current.notice.as_deref().unwrap_or_default());
    }
    if current.narration_error.is_some() && previous.narration_error != current.narration_error {
        println!("! {}", current.narration_error.as_deref().unwrap_or_default());
    }
}

/// Story text reached between two snapshots, in reading order.
fn story_lines(previous: &SessionState, current: &SessionState, story: &Story) -> Vec<String> {
    let mut lines = Vec::new();
    if current.phase == SessionPhase::Intro && previous.phase != SessionPhase::Intro {
        lines.push(story.intro.clone());
    }
    if current.phase == SessionPhase::Brushing {
        let first = match previous.phase {
            SessionPhase::Brushing => previous.current_segment_index + 1,
            _ => 0,
        };
        for index in first..=current.current_segment_index {
            lines.extend(story.brushing_prompts.get(index).cloned());
            lines.extend(story.segments.get(index).cloned());
        }
    }
    if current.phase == SessionPhase::Complete && previous.phase != SessionPhase::Complete {
        lines.push(story.conclusion.clone());
    }
    lines
}

pub async fn run_cli(args: CliArgs) -> Result<()> {
    let (mut playback, config) = load_settings(&args)?;

    let telemetry: Arc<dyn TelemetrySink> = match &args.telemetry {
        Some(path) => Arc::new(FileTelemetrySink::new(path.clone())?),
        None => Arc::new(LogTelemetrySink),
    };

    let synthesis: Arc<dyn SynthesisClient> = match &args.synthesis_url {
        Some(url) => Arc::new(HttpSynthesisClient::new(url.clone(), args.api_key.clone())?),
        None => {
            if playback.mode != PlaybackMode::Text {
                warn!("no --synthesis-url given, narration is off");
            }
            playback.mode = PlaybackMode::Text;
            Arc::new(NoSynthesis)
        }
    };

    let show_text = playback.mode != PlaybackMode::Audio;
    let source = args.story.clone().map(JsonStoryFile::new);
    let story = obtain_story(
        source.as_ref().map(|source| source as &dyn StorySource),
        &args.characters,
        &args.theme,
        telemetry.as_ref(),
    )
    .await;

    let controller = SessionController::new(
        story,
        config,
        playback,
        SessionServices {
            synthesis,
            device: playback_device(),
            telemetry,
            history: Arc::new(InMemoryHistory::new()),
        },
    )?;

    let story = controller.story();
    println!("Today's story: {} ({})", story.character_name, story.theme);
    println!("Press Enter to start brushing.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    if lines.next_line().await?.is_none() {
        return Ok(());
    }

    let session_id = controller.start_session().await?;
    info!("session {} running", session_id);
    println!("{HELP}");

    let mut snapshots = controller.subscribe();
    let mut last = snapshots.borrow_and_update().clone();
    println!("{}", describe(&last));
    if show_text {
        for line in story_lines(&SessionState::new(0), &last, controller.story()) {
            println!("\n{line}\n");
        }
    }

    let mut idle_check = time::interval(Duration::from_millis(250));
    idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                match Command::parse(&line) {
                    Some(Command::Play) => controller.play().await,
                    Some(Command::Pause) => controller.pause().await,
                    Some(Command::Stop) => controller.stop().await,
                    Some(Command::Favorite) => {
                        let favorite = controller.toggle_favorite();
                        println!("{}", if favorite { "added to favorites" } else { "removed from favorites" });
                    }
                    Some(Command::Hidden) => controller.set_app_hidden(true).await,
                    Some(Command::Visible) => controller.set_app_hidden(false).await,
                    Some(Command::Dismiss) => {
                        controller.dismiss_notice().await;
                        controller.dismiss_narration_error().await;
                    }
                    Some(Command::Quit) => break,
                    None if line.trim().is_empty() => {}
                    None => println!("{HELP}"),
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = snapshots.borrow_and_update().clone();
                report(&last, &current);
                if show_text {
                    for line in story_lines(&last, &current, controller.story()) {
                        println!("\n{line}\n");
                    }
                }
                last = current;
            }
            _ = idle_check.tick() => {
                if last.phase == SessionPhase::Complete && !controller.narration().is_active() {
                    println!("All done. Sparkly teeth!");
                    break;
                }
            }
        }
    }

    controller.shutdown().await;
    Ok(())
}
