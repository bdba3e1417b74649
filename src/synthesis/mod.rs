//! Speech synthesis: the client interface the narration queue consumes, the
//! voice catalog, and an HTTP implementation.

pub mod http;
pub mod voices;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::{sync::Arc, time::Duration};

use crate::error::SynthesisError;

pub use http::HttpSynthesisClient;
pub use voices::VoiceEngine;

/// Synthesized audio ready to hand to a playback device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRef {
    pub content_type: String,
    pub data: Arc<Vec<u8>>,
    /// Human-readable tag used in logs and playback records.
    pub label: String,
}

impl AudioRef {
    pub fn new(content_type: impl Into<String>, data: Vec<u8>, label: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            data: Arc::new(data),
            label: label.into(),
        }
    }

    /// Decodes a `data:<mime>;base64,<payload>` URL.
    pub fn from_data_url(url: &str, label: impl Into<String>) -> Result<Self, SynthesisError> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| SynthesisError::Provider("audio is not a data URL".into()))?;
        let (meta, payload) = rest
            .split_once(',')
            .ok_or_else(|| SynthesisError::Provider("data URL has no payload".into()))?;
        let content_type = meta
            .strip_suffix(";base64")
            .ok_or_else(|| SynthesisError::Provider("data URL is not base64 encoded".into()))?;

        let data = STANDARD
            .decode(payload.trim())
            .map_err(|err| SynthesisError::Provider(format!("invalid base64 audio: {err}")))?;
        if data.is_empty() {
            return Err(SynthesisError::EmptyResponse);
        }

        let content_type = if content_type.is_empty() {
            "audio/mpeg"
        } else {
            content_type
        };
        Ok(Self::new(content_type, data, label))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice_id: String,
    /// Engine override chosen by the caller after a failure on the preferred
    /// engine. `None` lets the provider pick.
    pub engine: Option<VoiceEngine>,
    pub timeout: Duration,
}

/// Text and voice in, audio out. Implementations must tolerate repeated calls
/// with identical arguments.
#[async_trait]
pub trait SynthesisClient: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioRef, SynthesisError>;
}
