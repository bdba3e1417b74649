use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};

use crate::{error::PlaybackError, synthesis::AudioRef};

use super::{PlaybackDevice, PlaybackEvent};

/// How long a simulated clip plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipLength {
    Fixed(Duration),
    /// Derived from the clip size at the given bytes per second.
    ByteRate(u64),
}

impl ClipLength {
    fn of(&self, audio: &AudioRef) -> Duration {
        match *self {
            ClipLength::Fixed(length) => length,
            ClipLength::ByteRate(rate) => {
                let rate = rate.max(1);
                Duration::from_millis((audio.len() as u64 * 1_000 / rate).max(1))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyBehavior {
    Immediate,
    /// Never signals ready; `buffered` decides whether a force start works.
    Silent { buffered: bool },
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRecord {
    pub label: String,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    /// Cut short by `stop` or a new `load`.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy)]
enum ClipStatus {
    Loaded,
    Playing { since: Instant },
    Paused,
    Finished,
}

struct Clip {
    events: mpsc::UnboundedSender<PlaybackEvent>,
    length: Duration,
    remaining: Duration,
    status: ClipStatus,
    label: String,
    record: Option<usize>,
}

#[derive(Default)]
struct SimState {
    unlocked: bool,
    epoch: u64,
    loads: usize,
    failing_loads: usize,
    clip: Option<Clip>,
    records: Vec<PlaybackRecord>,
}

impl SimState {
    fn release(&mut self, now: Instant) {
        self.epoch += 1;
        if let Some(clip) = self.clip.take() {
            if let (Some(index), ClipStatus::Playing { .. } | ClipStatus::Paused) =
                (clip.record, clip.status)
            {
                let record = &mut self.records[index];
                record.ended_at = Some(now);
                record.interrupted = true;
            }
        }
    }
}

/// Headless playback device driven by tokio timers.
///
/// Plays nothing audible; every clip simply lasts [`ClipLength`]. Keeps a log
/// of play intervals so callers can check ordering and overlap.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
    length: ClipLength,
    ready: ReadyBehavior,
}

impl SimulatedDevice {
    pub fn new(length: ClipLength) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            length,
            ready: ReadyBehavior::Immediate,
        }
    }

    pub fn with_ready(mut self, ready: ReadyBehavior) -> Self {
        self.ready = ready;
        self
    }

    /// Makes the next `count` loads report a decode failure.
    pub fn fail_next_loads(&self, count: usize) {
        self.lock().failing_loads = count;
    }

    pub fn records(&self) -> Vec<PlaybackRecord> {
        self.lock().records.clone()
    }

    pub fn load_count(&self) -> usize {
        self.lock().loads
    }

    pub fn was_unlocked(&self) -> bool {
        self.lock().unlocked
    }

    pub fn is_playing(&self) -> bool {
        matches!(
            self.lock().clip.as_ref().map(|clip| clip.status),
            Some(ClipStatus::Playing { .. })
        )
    }

    pub fn is_paused(&self) -> bool {
        matches!(
            self.lock().clip.as_ref().map(|clip| clip.status),
            Some(ClipStatus::Paused)
        )
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn schedule_end(&self, epoch: u64, after: Duration) {
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let mut guard = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if guard.epoch != epoch {
                return;
            }
            let now = Instant::now();
            let SimState { clip, records, .. } = &mut *guard;
            if let Some(clip) = clip.as_mut() {
                clip.status = ClipStatus::Finished;
                clip.remaining = Duration::ZERO;
                if let Some(index) = clip.record {
                    records[index].ended_at = Some(now);
                }
                let _ = clip.events.send(PlaybackEvent::Ended);
            }
        });
    }
}

impl PlaybackDevice for SimulatedDevice {
    fn unlock(&self) -> Result<(), PlaybackError> {
        self.lock().unlocked = true;
        Ok(())
    }

    fn load(
        &self,
        audio: AudioRef,
    ) -> Result<mpsc::UnboundedReceiver<PlaybackEvent>, PlaybackError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let length = self.length.of(&audio);

        let mut state = self.lock();
        state.release(Instant::now());
        state.loads += 1;

        let fail = if state.failing_loads > 0 {
            state.failing_loads -= 1;
            true
        } else {
            self.ready == ReadyBehavior::Fail
        };
        if fail {
            let _ = tx.send(PlaybackEvent::Failed(PlaybackError::Load(format!(
                "could not decode {}",
                audio.label
            ))));
        } else if self.ready == ReadyBehavior::Immediate {
            let _ = tx.send(PlaybackEvent::Ready);
        }

        state.clip = Some(Clip {
            events: tx,
            length,
            remaining: length,
            status: ClipStatus::Loaded,
            label: audio.label,
            record: None,
        });
        Ok(rx)
    }

    fn play(&self) -> Result<(), PlaybackError> {
        let now = Instant::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        let clip = state
            .clip
            .as_mut()
            .ok_or_else(|| PlaybackError::Device("nothing loaded".into()))?;

        match clip.status {
            ClipStatus::Loaded => {
                state.records.push(PlaybackRecord {
                    label: clip.label.clone(),
                    started_at: now,
                    ended_at: None,
                    interrupted: false,
                });
                clip.record = Some(state.records.len() - 1);
            }
            ClipStatus::Playing { .. } | ClipStatus::Finished => return Ok(()),
            ClipStatus::Paused => {}
        }
        clip.status = ClipStatus::Playing { since: now };
        let _ = clip.events.send(PlaybackEvent::Started);

        state.epoch += 1;
        let (epoch, remaining) = (state.epoch, clip.remaining);
        drop(guard);
        self.schedule_end(epoch, remaining);
        Ok(())
    }

    fn pause(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        let mut paused = false;
        if let Some(clip) = state.clip.as_mut() {
            if let ClipStatus::Playing { since } = clip.status {
                clip.remaining = clip.remaining.saturating_sub(now - since);
                clip.status = ClipStatus::Paused;
                paused = true;
            }
        }
        if paused {
            state.epoch += 1;
        }
    }

    fn resume(&self) {
        let is_paused = matches!(
            self.lock().clip.as_ref().map(|clip| clip.status),
            Some(ClipStatus::Paused)
        );
        if is_paused {
            let _ = self.play();
        }
    }

    fn stop(&self) {
        self.lock().release(Instant::now());
    }

    fn clip_duration(&self) -> Option<Duration> {
        self.lock().clip.as_ref().map(|clip| clip.length)
    }

    fn has_buffered_data(&self) -> bool {
        match self.ready {
            ReadyBehavior::Silent { buffered } => buffered,
            ReadyBehavior::Immediate => self
                .lock()
                .clip
                .as_ref()
                .is_some_and(|clip| !clip.length.is_zero()),
            ReadyBehavior::Fail => false,
        }
    }
}
