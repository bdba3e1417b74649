use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::timer::TimerSnapshot;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    #[default]
    Waiting,
    Intro,
    Brushing,
    Complete,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Waiting => "waiting",
            SessionPhase::Intro => "intro",
            SessionPhase::Brushing => "brushing",
            SessionPhase::Complete => "complete",
        }
    }
}

/// Everything an observer needs to render a session. Owned and mutated only by
/// the session controller.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub phase: SessionPhase,
    pub current_segment_index: usize,
    pub spoken_segments: BTreeSet<usize>,
    pub is_paused: bool,
    pub timer: TimerSnapshot,
    /// Dismissible notice, e.g. after a background auto-pause.
    pub notice: Option<String>,
    /// Transient indicator set when a narration item was dropped.
    pub narration_error: Option<String>,
    #[serde(skip)]
    pub(crate) intro_min_elapsed: bool,
    #[serde(skip)]
    pub(crate) intro_narration_done: bool,
}

impl SessionState {
    pub fn new(total_ms: u64) -> Self {
        Self {
            session_id: String::new(),
            phase: SessionPhase::Waiting,
            current_segment_index: 0,
            spoken_segments: BTreeSet::new(),
            is_paused: false,
            timer: TimerSnapshot::idle(total_ms),
            notice: None,
            narration_error: None,
            intro_min_elapsed: false,
            intro_narration_done: false,
        }
    }

    /// Resets everything for a fresh session and enters the intro.
    pub(crate) fn begin(&mut self, session_id: String, total_ms: u64, narration_enabled: bool) {
        *self = Self::new(total_ms);
        self.session_id = session_id;
        self.phase = SessionPhase::Intro;
        self.intro_narration_done = !narration_enabled;
    }

    pub(crate) fn intro_ready(&self) -> bool {
        self.phase == SessionPhase::Intro && self.intro_min_elapsed && self.intro_narration_done
    }
}
