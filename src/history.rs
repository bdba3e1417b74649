use std::{
    collections::{HashSet, VecDeque},
    sync::{Mutex, MutexGuard},
};

use crate::models::Story;

pub const MAX_HISTORY: usize = 50;

/// Where finished and favorite stories are remembered. Calls are
/// fire-and-forget from the session's point of view.
pub trait HistoryStore: Send + Sync {
    fn add_to_history(&self, story: &Story);
    /// Flips the favorite flag and returns the new value.
    fn toggle_favorite(&self, story_id: &str) -> bool;
    fn is_favorite(&self, story_id: &str) -> bool;
}

#[derive(Default)]
struct HistoryData {
    stories: VecDeque<Story>,
    favorites: HashSet<String>,
}

/// Most recent first, de-duplicated by story id.
#[derive(Default)]
pub struct InMemoryHistory {
    data: Mutex<HistoryData>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stories(&self) -> Vec<Story> {
        self.lock().stories.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HistoryData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HistoryStore for InMemoryHistory {
    fn add_to_history(&self, story: &Story) {
        let mut data = self.lock();
        data.stories.retain(|existing| existing.id != story.id);
        data.stories.push_front(story.clone());
        data.stories.truncate(MAX_HISTORY);
    }

    fn toggle_favorite(&self, story_id: &str) -> bool {
        let mut data = self.lock();
        if data.favorites.remove(story_id) {
            false
        } else {
            data.favorites.insert(story_id.to_string());
            true
        }
    }

    fn is_favorite(&self, story_id: &str) -> bool {
        self.lock().favorites.contains(story_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(id: &str) -> Story {
        let mut story = Story::placeholder("Nia", "ride a rocket");
        story.id = id.to_string();
        story
    }

    #[test]
    fn newest_first_without_duplicates() {
        let history = InMemoryHistory::new();
        history.add_to_history(&story("a"));
        history.add_to_history(&story("b"));
        history.add_to_history(&story("a"));

        let ids: Vec<String> = history.stories().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn history_is_capped() {
        let history = InMemoryHistory::new();
        for index in 0..(MAX_HISTORY + 10) {
            history.add_to_history(&story(&index.to_string()));
        }
        let stories = history.stories();
        assert_eq!(stories.len(), MAX_HISTORY);
        assert_eq!(stories[0].id, (MAX_HISTORY + 9).to_string());
    }

    #[test]
    fn favorites_toggle() {
        let history = InMemoryHistory::new();
        assert!(history.toggle_favorite("a"));
        assert!(history.is_favorite("a"));
        assert!(!history.toggle_favorite("a"));
        assert!(!history.is_favorite("a"));
    }
}
