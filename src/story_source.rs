use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde_json::{json, Map, Value};
use std::path::PathBuf;

use crate::{
    models::{Story, StoryDraft},
    telemetry::TelemetrySink,
};

/// Produces story drafts for a set of characters and a theme. May be slow or
/// fail; callers do not retry.
#[async_trait]
pub trait StorySource: Send + Sync {
    async fn fetch(&self, characters: &str, theme: &str) -> Result<StoryDraft>;
}

/// Reads a generator response saved as JSON.
pub struct JsonStoryFile {
    path: PathBuf,
}

impl JsonStoryFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl StorySource for JsonStoryFile {
    async fn fetch(&self, _characters: &str, _theme: &str) -> Result<StoryDraft> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read story from {}", self.path.display()))?;
        let draft = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse story in {}", self.path.display()))?;
        Ok(draft)
    }
}

fn payload(characters: &str, theme: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("characters".into(), json!(characters));
    map.insert("theme".into(), json!(theme));
    map
}

/// Fetches once and always returns a usable story: the repaired draft, or
/// the placeholder if the source failed.
pub async fn obtain_story(
    source: Option<&dyn StorySource>,
    characters: &str,
    theme: &str,
    telemetry: &dyn TelemetrySink,
) -> Story {
    telemetry.track_event("story_generate_start", payload(characters, theme));

    let fetched = match source {
        Some(source) => source.fetch(characters, theme).await,
        None => Err(anyhow::anyhow!("no story source configured")),
    };

    match fetched {
        Ok(draft) => {
            let story = Story::from_draft(draft, characters, theme).or_placeholder();
            info!("story {} ready for {}", story.id, story.character_name);
            let mut data = payload(characters, theme);
            data.insert("storyId".into(), json!(story.id));
            telemetry.track_event("story_generate_success", data);
            story
        }
        Err(err) => {
            warn!("using placeholder story: {:#}", err);
            let story = Story::placeholder(characters, theme);
            let mut data = payload(characters, theme);
            data.insert("storyId".into(), json!(story.id));
            data.insert("error".into(), json!(format!("{err:#}")));
            telemetry.track_event("story_generate_fallback", data);
            story
        }
    }
}
