use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};
use uuid::Uuid;

pub const MAX_STORED_EVENTS: usize = 1_000;
const APP_NAME: &str = "brushtales";

/// Best-effort analytics. Implementations must never fail the caller.
pub trait TelemetrySink: Send + Sync {
    fn track_event(&self, name: &str, payload: Map<String, Value>);
}

/// Writes events to the log and nowhere else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTelemetrySink;

impl TelemetrySink for LogTelemetrySink {
    fn track_event(&self, name: &str, payload: Map<String, Value>) {
        info!("telemetry {} {}", name, Value::Object(payload));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub id: String,
    pub event_name: String,
    pub payload: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub client_timestamp: i64,
    pub app: String,
}

impl TelemetryEvent {
    fn new(name: &str, payload: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            event_name: name.to_string(),
            payload,
            created_at: now,
            client_timestamp: now.timestamp_millis(),
            app: APP_NAME.to_string(),
        }
    }
}

/// Local JSON event log, newest first, capped at [`MAX_STORED_EVENTS`].
pub struct FileTelemetrySink {
    path: PathBuf,
    events: Mutex<Vec<TelemetryEvent>>,
}

impl FileTelemetrySink {
    pub fn new(path: PathBuf) -> Result<Self> {
        let events = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read telemetry log {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("discarding unreadable telemetry log {}: {}", path.display(), err);
                Vec::new()
            })
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            events: Mutex::new(events),
        })
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TelemetryEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, events: &[TelemetryEvent]) -> Result<()> {
        let serialized = serde_json::to_string(events)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write telemetry log {}", self.path.display()))
    }
}

impl TelemetrySink for FileTelemetrySink {
    fn track_event(&self, name: &str, payload: Map<String, Value>) {
        let mut events = self.lock();
        events.insert(0, TelemetryEvent::new(name, payload));
        events.truncate(MAX_STORED_EVENTS);
        if let Err(err) = self.persist(&events) {
            warn!("telemetry event {} not stored: {:#}", name, err);
        }
    }
}
