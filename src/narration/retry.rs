use std::time::Duration;

use crate::{
    settings::NarrationConfig,
    synthesis::voices::{self, VoiceEngine},
};

/// Bounded retry with exponential backoff: `base * 2^(attempt - 1)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub synthesis_timeout: Duration,
    pub fallback_voice: Option<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&NarrationConfig::default())
    }
}

impl From<&NarrationConfig> for RetryPolicy {
    fn from(config: &NarrationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            synthesis_timeout: Duration::from_millis(config.synthesis_timeout_ms),
            fallback_voice: config.fallback_voice_id.clone(),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, after `attempt` failures.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1 << exponent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCandidate {
    pub voice_id: String,
    pub engine: Option<VoiceEngine>,
}

/// Ordered voices to try for one narration item: the requested voice on its
/// preferred engine, then on its fallback engine, then the fallback voice.
#[derive(Debug, Clone)]
pub struct VoicePlan {
    candidates: Vec<VoiceCandidate>,
    position: usize,
}

impl VoicePlan {
    pub fn new(voice_id: &str, fallback_voice: Option<&str>) -> Self {
        let mut candidates = Vec::new();
        match voices::lookup(voice_id) {
            Some(profile) => {
                candidates.push(VoiceCandidate {
                    voice_id: profile.id.to_string(),
                    engine: Some(profile.engine),
                });
                if let Some(engine) = profile.fallback_engine {
                    candidates.push(VoiceCandidate {
                        voice_id: profile.id.to_string(),
                        engine: Some(engine),
                    });
                }
            }
            // Unknown to the catalog: pass it through and let the provider decide.
            None => candidates.push(VoiceCandidate {
                voice_id: voice_id.to_string(),
                engine: None,
            }),
        }

        if let Some(fallback) = fallback_voice {
            let fallback = voices::resolve(fallback);
            if !candidates.iter().any(|c| c.voice_id == fallback.id) {
                candidates.push(VoiceCandidate {
                    voice_id: fallback.id.to_string(),
                    engine: Some(fallback.engine),
                });
            }
        }

        Self {
            candidates,
            position: 0,
        }
    }

    pub fn current(&self) -> &VoiceCandidate {
        &self.candidates[self.position]
    }

    /// Moves to the next candidate. Returns `false` when already on the last.
    pub fn advance(&mut self) -> bool {
        if self.position + 1 < self.candidates.len() {
            self.position += 1;
            true
        } else {
            false
        }
    }

    pub fn candidates(&self) -> &[VoiceCandidate] {
        &self.candidates
    }
}
