use serde::{Deserialize, Serialize};

pub const DEFAULT_VOICE_ID: &str = "Joanna";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VoiceEngine {
    Generative,
    Neural,
    Standard,
}

impl VoiceEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceEngine::Generative => "generative",
            VoiceEngine::Neural => "neural",
            VoiceEngine::Standard => "standard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceProfile {
    pub id: &'static str,
    pub accent: &'static str,
    pub engine: VoiceEngine,
    pub fallback_engine: Option<VoiceEngine>,
}

const fn neural(id: &'static str, accent: &'static str) -> VoiceProfile {
    VoiceProfile {
        id,
        accent,
        engine: VoiceEngine::Neural,
        fallback_engine: None,
    }
}

static CATALOG: &[VoiceProfile] = &[
    neural("Joanna", "US English"),
    neural("Matthew", "US English"),
    neural("Ivy", "US English"),
    neural("Kevin", "US English"),
    neural("Salli", "US English"),
    neural("Justin", "US English"),
    VoiceProfile {
        id: "Ruth",
        accent: "US English",
        engine: VoiceEngine::Generative,
        fallback_engine: Some(VoiceEngine::Neural),
    },
    neural("Amy", "British English"),
    neural("Brian", "British English"),
    neural("Emma", "British English"),
    VoiceProfile {
        id: "Olivia",
        accent: "Australian English",
        engine: VoiceEngine::Generative,
        fallback_engine: Some(VoiceEngine::Neural),
    },
];

pub fn catalog() -> &'static [VoiceProfile] {
    CATALOG
}

/// Case-insensitive lookup of a known voice.
pub fn lookup(voice_id: &str) -> Option<&'static VoiceProfile> {
    let voice_id = voice_id.trim();
    CATALOG
        .iter()
        .find(|profile| profile.id.eq_ignore_ascii_case(voice_id))
}

/// Like [`lookup`], but unknown ids resolve to the default voice.
pub fn resolve(voice_id: &str) -> &'static VoiceProfile {
    lookup(voice_id)
        .or_else(|| lookup(DEFAULT_VOICE_ID))
        .unwrap_or(&CATALOG[0])
}
