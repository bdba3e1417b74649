use async_trait::async_trait;
use log::debug;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::SynthesisError;

use super::{AudioRef, SynthesisClient, SynthesisRequest, VoiceEngine};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeBody<'a> {
    text: &'a str,
    voice_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    engine: Option<VoiceEngine>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SynthesizeResponse {
    audio_data: Option<String>,
    error: Option<String>,
}

/// Talks to a speech endpoint that accepts `{text, voiceId, engine}` and
/// answers either with raw audio or with a JSON `audioData` data URL.
pub struct HttpSynthesisClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSynthesisClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("brushtales/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

fn label_for(text: &str) -> String {
    let mut label: String = text.chars().take(24).collect();
    if text.chars().count() > 24 {
        label.push('…');
    }
    label
}

/// Turns a non-audio response body into audio or a typed failure.
fn parse_response(status: StatusCode, body: &str, label: &str) -> Result<AudioRef, SynthesisError> {
    let parsed: SynthesizeResponse = serde_json::from_str(body).unwrap_or_default();

    if !status.is_success() {
        let message = parsed
            .error
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        return Err(SynthesisError::Provider(message));
    }
    if let Some(error) = parsed.error.filter(|e| !e.trim().is_empty()) {
        return Err(SynthesisError::Provider(error));
    }

    match parsed.audio_data {
        Some(url) if !url.trim().is_empty() => AudioRef::from_data_url(&url, label),
        _ => Err(SynthesisError::EmptyResponse),
    }
}

#[async_trait]
impl SynthesisClient for HttpSynthesisClient {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioRef, SynthesisError> {
        let timeout_err = || SynthesisError::Timeout {
            after_ms: request.timeout.as_millis() as u64,
        };
        let transport_err = |err: reqwest::Error| {
            if err.is_timeout() {
                timeout_err()
            } else {
                SynthesisError::Provider(err.to_string())
            }
        };

        let body = SynthesizeBody {
            text: &request.text,
            voice_id: &request.voice_id,
            engine: request.engine,
        };
        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(request.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(
            "synthesizing {} chars with voice {} ({:?})",
            request.text.len(),
            request.voice_id,
            request.engine
        );
        let response = builder.send().await.map_err(transport_err)?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let label = label_for(&request.text);

        if status.is_success() && content_type.starts_with("audio/") {
            let bytes = response.bytes().await.map_err(transport_err)?;
            if bytes.is_empty() {
                return Err(SynthesisError::EmptyResponse);
            }
            return Ok(AudioRef::new(content_type, bytes.to_vec(), label));
        }

        let text = response.text().await.map_err(transport_err)?;
        parse_response(status, &text, &label)
    }
}
