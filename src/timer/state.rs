use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::models::story::SEGMENT_COUNT;

/// Minimum change in remaining time before a new snapshot is published.
/// Keeps observers near 30 updates per second.
pub const PAINT_THRESHOLD_MS: u64 = 33;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TimerStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub status: TimerStatus,
    pub total_ms: u64,
    pub remaining_ms: u64,
    pub segment_index: usize,
    pub progress_fraction: f64,
}

impl TimerSnapshot {
    pub fn idle(total_ms: u64) -> Self {
        Self {
            status: TimerStatus::Idle,
            total_ms,
            remaining_ms: total_ms,
            segment_index: 0,
            progress_fraction: 0.0,
        }
    }
}

/// What a single tick produced. Everything is optional: most ticks change
/// nothing an observer would notice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub snapshot: Option<TimerSnapshot>,
    pub segment_changed: Option<usize>,
    pub completed: bool,
}

/// Index of the segment containing `elapsed_ms`, clamped to the last segment.
pub fn segment_index_for(total_ms: u64, elapsed_ms: u64) -> usize {
    if total_ms == 0 {
        return 0;
    }
    let elapsed = elapsed_ms.min(total_ms) as u128;
    let index = elapsed * SEGMENT_COUNT as u128 / total_ms as u128;
    (index as usize).min(SEGMENT_COUNT - 1)
}

fn ceil_millis(duration: Duration) -> u64 {
    let whole = duration.as_millis() as u64;
    if duration.subsec_nanos() % 1_000_000 == 0 {
        whole
    } else {
        whole + 1
    }
}

/// Countdown state using the end-timestamp model.
///
/// While running only `end_at` is authoritative; `remaining_ms` is the value
/// frozen by the last pause (or the last observed tick).
#[derive(Debug, Clone)]
pub struct CountdownState {
    pub status: TimerStatus,
    total_ms: u64,
    remaining_ms: u64,
    end_at: Option<Instant>,
    last_painted_ms: u64,
    last_segment: Option<usize>,
}

impl CountdownState {
    pub fn new(total_ms: u64) -> Self {
        Self {
            status: TimerStatus::Idle,
            total_ms,
            remaining_ms: total_ms,
            end_at: None,
            last_painted_ms: total_ms,
            last_segment: None,
        }
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }

    /// Discards everything derived from the previous duration.
    pub fn reset(&mut self, total_ms: u64) {
        *self = Self::new(total_ms);
    }

    pub fn start(&mut self, total_ms: u64, now: Instant) {
        self.reset(total_ms);
        self.status = TimerStatus::Running;
        self.end_at = Some(now + Duration::from_millis(total_ms));
    }

    /// Freezes the remaining time. Returns `None` unless the timer was running.
    pub fn pause(&mut self, now: Instant) -> Option<u64> {
        if self.status != TimerStatus::Running {
            return None;
        }
        self.remaining_ms = self.remaining_at(now);
        self.end_at = None;
        self.status = TimerStatus::Paused;
        Some(self.remaining_ms)
    }

    /// Recomputes a fresh end timestamp from the frozen remaining time.
    pub fn resume(&mut self, now: Instant) -> bool {
        if self.status != TimerStatus::Paused {
            return false;
        }
        self.end_at = Some(now + Duration::from_millis(self.remaining_ms));
        self.status = TimerStatus::Running;
        true
    }

    pub fn cancel(&mut self) {
        let total_ms = self.total_ms;
        self.reset(total_ms);
    }

    pub fn remaining_at(&self, now: Instant) -> u64 {
        match self.end_at {
            Some(end_at) => ceil_millis(end_at.saturating_duration_since(now)).min(self.total_ms),
            None => self.remaining_ms,
        }
    }

    pub fn snapshot_at(&self, now: Instant) -> TimerSnapshot {
        let remaining_ms = self.remaining_at(now);
        let elapsed_ms = self.total_ms - remaining_ms;
        let progress_fraction = if self.total_ms == 0 {
            1.0
        } else {
            (elapsed_ms as f64 / self.total_ms as f64).clamp(0.0, 1.0)
        };

        TimerSnapshot {
            status: self.status,
            total_ms: self.total_ms,
            remaining_ms,
            segment_index: segment_index_for(self.total_ms, elapsed_ms),
            progress_fraction,
        }
    }

    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if self.status != TimerStatus::Running {
            return outcome;
        }

        let remaining_ms = self.remaining_at(now);
        self.remaining_ms = remaining_ms;

        if remaining_ms > 0 {
            let index = segment_index_for(self.total_ms, self.total_ms - remaining_ms);
            if self.last_segment != Some(index) {
                self.last_segment = Some(index);
                outcome.segment_changed = Some(index);
            }
        } else {
            self.status = TimerStatus::Completed;
            self.end_at = None;
            outcome.completed = true;
        }

        if remaining_ms == 0 || self.last_painted_ms.abs_diff(remaining_ms) >= PAINT_THRESHOLD_MS {
            self.last_painted_ms = remaining_ms;
            outcome.snapshot = Some(self.snapshot_at(now));
        }

        outcome
    }
}
