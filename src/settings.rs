use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::synthesis::voices::DEFAULT_VOICE_ID;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackMode {
    Audio,
    Text,
    #[default]
    Both,
}

impl PlaybackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackMode::Audio => "audio",
            PlaybackMode::Text => "text",
            PlaybackMode::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PlaybackSettings {
    pub mode: PlaybackMode,
    pub auto_play: bool,
    pub voice_id: String,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            mode: PlaybackMode::Both,
            auto_play: true,
            voice_id: DEFAULT_VOICE_ID.into(),
        }
    }
}

impl PlaybackSettings {
    pub fn narration_enabled(&self) -> bool {
        self.auto_play && self.mode != PlaybackMode::Text
    }
}

/// Retry, timeout and pacing knobs for the narration queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NarrationConfig {
    pub synthesis_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub inter_item_gap_ms: u64,
    pub ready_timeout_ms: u64,
    pub stall_timeout_ms: u64,
    pub fallback_voice_id: Option<String>,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            synthesis_timeout_ms: 12_000,
            max_attempts: 3,
            backoff_base_ms: 500,
            inter_item_gap_ms: 300,
            ready_timeout_ms: 5_000,
            stall_timeout_ms: 30_000,
            fallback_voice_id: Some(DEFAULT_VOICE_ID.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub total_duration_ms: u64,
    pub intro_min_ms: u64,
    pub intro_max_ms: u64,
    pub background_pause_ms: u64,
    pub tick_interval_ms: u64,
    pub narration: NarrationConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            total_duration_ms: 120_000,
            intro_min_ms: 5_000,
            intro_max_ms: 25_000,
            background_pause_ms: 5_000,
            tick_interval_ms: 16,
            narration: NarrationConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.total_duration_ms == 0 {
            bail!("totalDurationMs must be greater than zero");
        }
        if self.intro_min_ms > self.intro_max_ms {
            bail!(
                "introMinMs ({}) must not exceed introMaxMs ({})",
                self.intro_min_ms,
                self.intro_max_ms
            );
        }
        if self.tick_interval_ms == 0 {
            bail!("tickIntervalMs must be greater than zero");
        }
        if self.narration.max_attempts == 0 {
            bail!("narration.maxAttempts must be at least 1");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UserSettings {
    playback: PlaybackSettings,
    session: SessionConfig,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(
                    "ignoring unreadable settings in {}: {}",
                    path.display(),
                    err
                );
                UserSettings::default()
            })
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn playback(&self) -> PlaybackSettings {
        self.read().playback.clone()
    }

    pub fn update_playback(&self, settings: PlaybackSettings) -> Result<()> {
        let mut guard = self.write();
        guard.playback = settings;
        self.persist(&guard)
    }

    pub fn session_config(&self) -> SessionConfig {
        self.read().session.clone()
    }

    pub fn update_session_config(&self, config: SessionConfig) -> Result<()> {
        config.validate()?;
        let mut guard = self.write();
        guard.session = config;
        self.persist(&guard)
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: UserSettings = serde_json::from_str(&contents)?;
        *self.write() = data;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, UserSettings> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, UserSettings> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_product_values() {
        let config = SessionConfig::default();
        assert_eq!(config.total_duration_ms, 120_000);
        assert_eq!(config.intro_min_ms, 5_000);
        assert_eq!(config.intro_max_ms, 25_000);
        assert_eq!(config.background_pause_ms, 5_000);
        assert_eq!(config.narration.max_attempts, 3);
        assert!(config.validate().is_ok());
        assert!(PlaybackSettings::default().narration_enabled());
    }

    #[test]
    fn narration_requires_auto_play_and_audio_mode() {
        let mut settings = PlaybackSettings::default();
        settings.mode = PlaybackMode::Text;
        assert!(!settings.narration_enabled());

        settings.mode = PlaybackMode::Audio;
        settings.auto_play = false;
        assert!(!settings.narration_enabled());
    }

    #[test]
    fn validate_rejects_inverted_intro_bounds() {
        let config = SessionConfig {
            intro_min_ms: 30_000,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            total_duration_ms: 0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "playback": { "voiceId": "Olivia" }, "session": { "introMaxMs": 8000 } }"#,
        )
        .unwrap();

        let store = SettingsStore::new(path).unwrap();
        assert_eq!(store.playback().voice_id, "Olivia");
        assert!(store.playback().auto_play);
        assert_eq!(store.session_config().intro_max_ms, 8_000);
        assert_eq!(store.session_config().total_duration_ms, 120_000);
    }

    #[test]
    fn updates_are_persisted_and_reloadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::new(path.clone()).unwrap();
        store
            .update_playback(PlaybackSettings {
                mode: PlaybackMode::Audio,
                auto_play: true,
                voice_id: "Amy".into(),
            })
            .unwrap();

        let invalid = SessionConfig {
            narration: NarrationConfig {
                max_attempts: 0,
                ..NarrationConfig::default()
            },
            ..SessionConfig::default()
        };
        assert!(store.update_session_config(invalid).is_err());

        let reopened = SettingsStore::new(path).unwrap();
        assert_eq!(reopened.playback().voice_id, "Amy");
        assert_eq!(reopened.playback().mode, PlaybackMode::Audio);
        reopened.reload().unwrap();
        assert_eq!(reopened.session_config(), SessionConfig::default());
    }

    #[test]
    fn garbage_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();

        let store = SettingsStore::new(path).unwrap();
        assert_eq!(store.playback(), PlaybackSettings::default());
    }
}
