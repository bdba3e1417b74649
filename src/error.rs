//! Error types for narration and story handling.
//!
//! Synthesis and playback failures are retried inside the narration queue and
//! only ever leave it as data (a dropped item's outcome), never as a fault.

use thiserror::Error;

/// Failure reported by a speech-synthesis provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    /// The provider did not answer within the per-attempt budget.
    #[error("speech synthesis timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// The provider answered with an error.
    #[error("speech provider error: {0}")]
    Provider(String),

    /// The provider answered successfully but without audio.
    #[error("speech provider returned no audio")]
    EmptyResponse,
}

impl SynthesisError {
    /// Timeouts are worth retrying on the same voice; anything else suggests
    /// switching to a fallback voice or engine.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SynthesisError::Timeout { .. })
    }
}

/// Failure reported by a playback device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error("audio failed to load: {0}")]
    Load(String),

    #[error("playback device error: {0}")]
    Device(String),

    /// Failed after audio was already audible. Replaying would restart the
    /// clip from the beginning, so this is not retried.
    #[error("playback interrupted: {0}")]
    Interrupted(String),
}

impl PlaybackError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PlaybackError::Interrupted(_))
    }
}

/// Why a narration item was dropped after its retries ran out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NarrationError {
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),
}

impl NarrationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            NarrationError::Synthesis(_) => true,
            NarrationError::Playback(err) => err.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoryError {
    #[error("malformed story data: {0}")]
    Malformed(String),
}
