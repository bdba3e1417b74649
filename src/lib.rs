pub mod audio;
pub mod cli;
pub mod clock;
pub mod error;
pub mod history;
pub mod models;
pub mod narration;
pub mod session;
pub mod settings;
pub mod story_source;
pub mod synthesis;
pub mod telemetry;
pub mod timer;
pub mod utils;

#[cfg(test)]
mod test_support;

use clap::Parser;

pub use audio::{PlaybackDevice, PlaybackEvent, SimulatedDevice};
pub use error::{NarrationError, PlaybackError, StoryError, SynthesisError};
pub use models::{SessionPhase, SessionState, Story, StoryDraft};
pub use narration::{NarrationOutcome, NarrationQueue};
pub use session::{SessionController, SessionServices};
pub use settings::{PlaybackMode, PlaybackSettings, SessionConfig, SettingsStore};
pub use synthesis::{AudioRef, SynthesisClient, SynthesisRequest};
pub use timer::{CountdownTimer, TimerSnapshot};

pub fn run() -> anyhow::Result<()> {
    let args = cli::CliArgs::parse();
    utils::init_logging(args.debug);

    log::info!("BrushTales starting up...");

    // One cooperative thread: timers, synthesis and playback interleave on it.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(cli::run_cli(args))
}
