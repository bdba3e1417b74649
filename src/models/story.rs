use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoryError;

/// Number of equal slices a brushing session is divided into.
pub const SEGMENT_COUNT: usize = 4;

const DEFAULT_CHARACTER: &str = "Alex";
const DEFAULT_THEME: &str = "going on an adventure";

/// A complete, narratable story. Always carries exactly four segments and
/// four brushing prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub character_name: String,
    pub theme: String,
    pub intro: String,
    pub segments: [String; SEGMENT_COUNT],
    pub brushing_prompts: [String; SEGMENT_COUNT],
    pub conclusion: String,
    #[serde(default)]
    pub is_fallback: bool,
}

/// Story data as delivered by the upstream generator, where any field may be
/// missing, blank or the wrong length.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoryDraft {
    pub id: Option<String>,
    pub character_name: Option<String>,
    pub theme: Option<String>,
    pub intro: Option<String>,
    pub segments: Option<Vec<String>>,
    pub brushing_prompts: Option<Vec<String>>,
    pub conclusion: Option<String>,
}

/// Joins a free-form list of names naturally: "Arlo, Luna and Max".
pub fn format_names(input: &str) -> String {
    let normalized = input.replace(" and ", ",").replace(" & ", ",");
    let names: Vec<&str> = normalized
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect();

    match names.as_slice() {
        [] => input.trim().to_string(),
        [single] => single.to_string(),
        [first, second] => format!("{first} and {second}"),
        [rest @ .., last] => format!("{} and {}", rest.join(", "), last),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn repair_list(
    field: &str,
    value: Option<Vec<String>>,
    fallback: &[String; SEGMENT_COUNT],
    problems: &mut Vec<StoryError>,
) -> [String; SEGMENT_COUNT] {
    let list: Vec<String> = value
        .unwrap_or_default()
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();

    if list.is_empty() {
        problems.push(StoryError::Malformed(format!("{field} missing")));
        return fallback.clone();
    }
    if list.len() < SEGMENT_COUNT {
        problems.push(StoryError::Malformed(format!(
            "{field} has {} of {SEGMENT_COUNT} entries",
            list.len()
        )));
    }

    std::array::from_fn(|index| {
        list.get(index)
            .cloned()
            .unwrap_or_else(|| fallback[index].clone())
    })
}

impl Story {
    /// Locally generated story used when the upstream generator is unavailable
    /// or delivered something unusable.
    pub fn placeholder(characters: &str, theme: &str) -> Self {
        let characters = if characters.trim().is_empty() {
            DEFAULT_CHARACTER
        } else {
            characters.trim()
        };
        let theme = if theme.trim().is_empty() {
            DEFAULT_THEME
        } else {
            theme.trim()
        };
        let name = format_names(characters);

        Self {
            id: Uuid::new_v4().to_string(),
            character_name: characters.to_string(),
            theme: theme.to_string(),
            intro: format!(
                "Get ready for adventure! {name} is about to {theme}! Grab your toothbrush and let's make some magic happen!"
            ),
            segments: [
                format!("{name} couldn't believe today was finally the day to {theme}! With a sparkly toothbrush in hand, {name} was ready for anything. The adventure was about to begin, and {name} could feel the excitement bubbling up inside."),
                format!("As {name} continued the {theme} journey, a friendly helper appeared. \"I'll help you!\" it said with a grin. Together they faced the first challenge. {name}'s bright smile lit up the way. \"We can do this!\" {name} cheered."),
                format!("The {theme} adventure was getting more exciting by the minute. {name} had to be brave and clever. With quick thinking and those super-sparkly teeth shining bright, {name} found the perfect solution. \"Almost there!\" {name} shouted happily."),
                format!("{name} did it! The {theme} adventure was a complete success. Everyone cheered and celebrated. {name}'s teeth sparkled brighter than ever before. \"That was the best adventure ever!\" {name} laughed, doing a happy victory dance."),
            ],
            brushing_prompts: [
                "Great start! Now brush your bottom teeth in gentle circles.".to_string(),
                "You're doing awesome! Let's brush your top teeth next.".to_string(),
                "Nice work so far. Now brush the left side.".to_string(),
                "Almost there! Finish strong by brushing the right side.".to_string(),
            ],
            conclusion: format!(
                "What an amazing adventure! {name} conquered the {theme} challenge! Your teeth are super clean and sparkly! You're a champion!"
            ),
            is_fallback: true,
        }
    }

    /// Builds a story from a draft, filling every missing or blank part from
    /// the placeholder for the same characters and theme.
    pub fn from_draft(draft: StoryDraft, characters: &str, theme: &str) -> Self {
        let mut problems = Vec::new();
        let character_name = non_blank(draft.character_name).unwrap_or_else(|| characters.to_string());
        let theme = non_blank(draft.theme).unwrap_or_else(|| theme.to_string());
        let fallback = Self::placeholder(&character_name, &theme);

        let mut text_field = |field: &str, value: Option<String>, fallback: &str| {
            non_blank(value).unwrap_or_else(|| {
                problems.push(StoryError::Malformed(format!("{field} missing")));
                fallback.to_string()
            })
        };
        let intro = text_field("intro", draft.intro, &fallback.intro);
        let conclusion = text_field("conclusion", draft.conclusion, &fallback.conclusion);

        let segments = repair_list("segments", draft.segments, &fallback.segments, &mut problems);
        let brushing_prompts = repair_list(
            "brushingPrompts",
            draft.brushing_prompts,
            &fallback.brushing_prompts,
            &mut problems,
        );

        for problem in &problems {
            warn!("repairing story draft: {}", problem);
        }

        Self {
            id: non_blank(draft.id).unwrap_or_else(|| Uuid::new_v4().to_string()),
            character_name,
            theme,
            intro,
            segments,
            brushing_prompts,
            conclusion,
            is_fallback: false,
        }
    }

    pub fn validate(&self) -> Result<(), StoryError> {
        if self.id.trim().is_empty() {
            return Err(StoryError::Malformed("id is blank".into()));
        }
        if self.intro.trim().is_empty() {
            return Err(StoryError::Malformed("intro is blank".into()));
        }
        if self.conclusion.trim().is_empty() {
            return Err(StoryError::Malformed("conclusion is blank".into()));
        }
        if let Some(index) = self.segments.iter().position(|s| s.trim().is_empty()) {
            return Err(StoryError::Malformed(format!("segment {index} is blank")));
        }
        if let Some(index) = self.brushing_prompts.iter().position(|s| s.trim().is_empty()) {
            return Err(StoryError::Malformed(format!("brushing prompt {index} is blank")));
        }
        Ok(())
    }

    /// Returns `self` if it validates, otherwise a placeholder for the same
    /// characters and theme.
    pub fn or_placeholder(self) -> Self {
        match self.validate() {
            Ok(()) => self,
            Err(err) => {
                warn!("{}; substituting placeholder story", err);
                Self::placeholder(&self.character_name, &self.theme)
            }
        }
    }
}
