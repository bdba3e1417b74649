pub mod queue;
pub mod retry;

pub use queue::{CompletionCallback, ItemId, NarrationEvent, NarrationOutcome, NarrationQueue};
pub use retry::{RetryPolicy, VoiceCandidate, VoicePlan};
