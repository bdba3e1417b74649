pub mod session;
pub mod story;

pub use session::{SessionPhase, SessionState};
pub use story::{format_names, Story, StoryDraft, SEGMENT_COUNT};
