//! Playback devices and the load/ready/ended choreography shared by all of
//! them.

#[cfg(feature = "speaker")]
pub mod rodio_device;
pub mod simulated;

#[cfg(feature = "speaker")]
pub use rodio_device::RodioDevice;
pub use simulated::{ClipLength, PlaybackRecord, ReadyBehavior, SimulatedDevice};

use log::{debug, warn};
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant},
};

use crate::{error::PlaybackError, synthesis::AudioRef};

/// Events for the currently loaded clip. Each `load` hands out a fresh
/// receiver, so nothing from a previous clip can leak into the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Enough audio is decoded to start.
    Ready,
    Started,
    /// Audio is still advancing. Devices that cannot tell a clip's length
    /// send this periodically while playing.
    Progress,
    Ended,
    Failed(PlaybackError),
}

/// A single output that plays at most one clip at a time.
pub trait PlaybackDevice: Send + Sync {
    /// Plays a short silent clip so later playback is allowed. Must be called
    /// from the user's explicit start action.
    fn unlock(&self) -> Result<(), PlaybackError>;

    /// Stops and releases whatever was loaded, then loads `audio`.
    fn load(&self, audio: AudioRef)
        -> Result<mpsc::UnboundedReceiver<PlaybackEvent>, PlaybackError>;

    fn play(&self) -> Result<(), PlaybackError>;
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);

    /// Length of the loaded clip, when the decoder knows it.
    fn clip_duration(&self) -> Option<Duration>;

    /// Whether some audio is decoded even though no ready signal was sent.
    fn has_buffered_data(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackTiming {
    pub ready_timeout: Duration,
    /// Allowance past the clip's known length (or past the last progress
    /// report) before playback counts as stalled.
    pub stall_timeout: Duration,
}

impl Default for PlaybackTiming {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(30),
        }
    }
}

async fn wait_ready(
    events: &mut mpsc::UnboundedReceiver<PlaybackEvent>,
) -> Result<(), PlaybackError> {
    loop {
        match events.recv().await {
            Some(PlaybackEvent::Ready) | Some(PlaybackEvent::Started) => return Ok(()),
            Some(PlaybackEvent::Failed(err)) => return Err(err),
            Some(PlaybackEvent::Ended) | Some(PlaybackEvent::Progress) => continue,
            None => return Err(PlaybackError::Load("device dropped the clip".into())),
        }
    }
}

/// Plays a freshly loaded clip to its end.
///
/// Starts on the first ready signal, or force-starts after `ready_timeout` if
/// the device holds buffered audio. Playback only begins once `paused` is
/// false. The stall deadline is the clip's length plus `stall_timeout`, is
/// held while paused and moves out on every progress report. Any failure
/// after `play` is reported as [`PlaybackError::Interrupted`].
pub async fn drive_playback(
    device: &dyn PlaybackDevice,
    mut events: mpsc::UnboundedReceiver<PlaybackEvent>,
    timing: PlaybackTiming,
    mut paused: watch::Receiver<bool>,
) -> Result<(), PlaybackError> {
    match time::timeout(timing.ready_timeout, wait_ready(&mut events)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            device.stop();
            return Err(err);
        }
        Err(_) if device.has_buffered_data() => {
            warn!(
                "no ready signal after {}ms, force-starting playback",
                timing.ready_timeout.as_millis()
            );
        }
        Err(_) => {
            device.stop();
            return Err(PlaybackError::Load(format!(
                "device not ready after {}ms",
                timing.ready_timeout.as_millis()
            )));
        }
    }

    paused
        .wait_for(|is_paused| !*is_paused)
        .await
        .map_err(|_| PlaybackError::Device("narration closed while paused".into()))?;
    device.play()?;

    let clip_length = device.clip_duration().unwrap_or_default();
    let mut played = Duration::ZERO;
    let mut running_since = Some(Instant::now());
    let mut deadline = Instant::now() + clip_length + timing.stall_timeout;
    loop {
        let is_paused = *paused.borrow_and_update();
        let now = Instant::now();
        match (is_paused, running_since) {
            (true, Some(since)) => {
                played += now - since;
                running_since = None;
            }
            (false, None) => {
                running_since = Some(now);
                deadline = now + clip_length.saturating_sub(played) + timing.stall_timeout;
            }
            _ => {}
        }

        tokio::select! {
            event = events.recv() => match event {
                Some(PlaybackEvent::Ended) => return Ok(()),
                Some(PlaybackEvent::Failed(err)) => {
                    device.stop();
                    return Err(PlaybackError::Interrupted(err.to_string()));
                }
                Some(PlaybackEvent::Progress) => {
                    deadline = deadline.max(Instant::now() + timing.stall_timeout);
                }
                Some(PlaybackEvent::Started) => debug!("playback started"),
                Some(PlaybackEvent::Ready) => {}
                None => {
                    return Err(PlaybackError::Interrupted("playback events closed".into()))
                }
            },
            changed = paused.changed() => {
                if changed.is_err() {
                    device.stop();
                    return Err(PlaybackError::Interrupted(
                        "narration closed during playback".into(),
                    ));
                }
            }
            _ = time::sleep_until(deadline), if !is_paused => {
                device.stop();
                return Err(PlaybackError::Interrupted(format!(
                    "no end of playback {}ms past the clip's length",
                    timing.stall_timeout.as_millis()
                )));
            }
        }
    }
}
