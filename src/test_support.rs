//! Doubles shared by the unit tests.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::{
    collections::VecDeque,
    sync::Mutex,
    time::Duration,
};

use crate::{
    error::SynthesisError,
    synthesis::{AudioRef, SynthesisClient, SynthesisRequest},
    telemetry::TelemetrySink,
};

#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(SynthesisError),
    /// Never answers; only the caller's timeout ends the call.
    Hang,
}

/// Synthesis client that follows a script, then repeats a default step.
/// The clip label is the requested text.
pub struct ScriptedSynthesis {
    script: Mutex<VecDeque<Step>>,
    default: Step,
    latency: Duration,
    calls: Mutex<Vec<SynthesisRequest>>,
}

impl ScriptedSynthesis {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default: Step::Succeed,
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Vec::new())
    }

    pub fn always(step: Step) -> Self {
        Self {
            default: step,
            ..Self::new(Vec::new())
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<SynthesisRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SynthesisClient for ScriptedSynthesis {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<AudioRef, SynthesisError> {
        self.calls.lock().unwrap().push(request.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match step {
            Step::Succeed => Ok(AudioRef::new(
                "audio/mpeg",
                request.text.as_bytes().to_vec(),
                request.text.clone(),
            )),
            Step::Fail(err) => Err(err),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Telemetry sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl RecordingTelemetry {
    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn last(&self, name: &str) -> Option<Map<String, Value>> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(event, _)| event == name)
            .map(|(_, payload)| payload.clone())
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn track_event(&self, name: &str, payload: Map<String, Value>) {
        self.events.lock().unwrap().push((name.to_string(), payload));
    }
}
