use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use log::{debug, info};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::clock::{MonotonicClock, TimeSource};

use super::{CountdownState, TimerSnapshot, TimerStatus};

/// Notifications published by the countdown ticker.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerEvent {
    /// Remaining time moved by at least the paint threshold, or hit zero.
    Tick(TimerSnapshot),
    /// The elapsed time entered a new segment.
    SegmentChanged(usize),
    /// The countdown reached zero. Sent exactly once per start.
    Completed,
}

#[derive(Clone)]
pub struct CountdownTimer {
    state: Arc<Mutex<CountdownState>>,
    clock: Arc<dyn TimeSource>,
    events: mpsc::UnboundedSender<TimerEvent>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    tick_interval: Duration,
}

impl CountdownTimer {
    pub fn new(
        total_ms: u64,
        tick_interval: Duration,
        events: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        Self::with_clock(total_ms, tick_interval, events, Arc::new(MonotonicClock))
    }

    pub fn with_clock(
        total_ms: u64,
        tick_interval: Duration,
        events: mpsc::UnboundedSender<TimerEvent>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(CountdownState::new(total_ms))),
            clock,
            events,
            ticker: Arc::new(Mutex::new(None)),
            tick_interval,
        }
    }

    pub async fn snapshot(&self) -> TimerSnapshot {
        let guard = self.state.lock().await;
        guard.snapshot_at(self.clock.now())
    }

    pub async fn start(&self, total_ms: u64) -> Result<TimerSnapshot> {
        if total_ms == 0 {
            return Err(anyhow!("countdown duration must be greater than zero"));
        }

        {
            let mut state = self.state.lock().await;
            if matches!(state.status, TimerStatus::Running | TimerStatus::Paused) {
                return Err(anyhow!("timer already active"));
            }
            state.start(total_ms, self.clock.now());
        }

        info!("countdown started for {}ms", total_ms);
        self.spawn_ticker().await;
        Ok(self.snapshot().await)
    }

    /// Returns the frozen remaining time, or `None` if the timer was not running.
    pub async fn pause(&self) -> Option<u64> {
        self.cancel_ticker().await;
        let mut state = self.state.lock().await;
        let frozen = state.pause(self.clock.now());
        if let Some(remaining_ms) = frozen {
            debug!("countdown paused with {}ms remaining", remaining_ms);
            let _ = self
                .events
                .send(TimerEvent::Tick(state.snapshot_at(self.clock.now())));
        }
        frozen
    }

    pub async fn resume(&self) -> bool {
        let resumed = {
            let mut state = self.state.lock().await;
            state.resume(self.clock.now())
        };
        if resumed {
            debug!("countdown resumed");
            self.spawn_ticker().await;
        }
        resumed
    }

    pub async fn cancel(&self) {
        self.cancel_ticker().await;
        self.state.lock().await.cancel();
    }

    /// Switches to a new duration, discarding all progress.
    pub async fn set_total_duration(&self, total_ms: u64) {
        self.cancel_ticker().await;
        self.state.lock().await.reset(total_ms);
    }

    async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let state = self.state.clone();
        let clock = self.clock.clone();
        let events = self.events.clone();
        let tick_interval = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;

                let outcome = {
                    let mut guard = state.lock().await;
                    if guard.status != TimerStatus::Running {
                        break;
                    }
                    guard.tick(clock.now())
                };

                if let Some(index) = outcome.segment_changed {
                    let _ = events.send(TimerEvent::SegmentChanged(index));
                }
                if let Some(snapshot) = outcome.snapshot {
                    let _ = events.send(TimerEvent::Tick(snapshot));
                }
                if outcome.completed {
                    info!("countdown complete");
                    let _ = events.send(TimerEvent::Completed);
                    break;
                }
            }
        });

        *ticker_guard = Some(handle);
    }

    async fn cancel_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }
}
