use std::time::Duration;
use tokio::time::Instant;

/// Tracks how long the app has been continuously hidden.
///
/// Every hide starts a new epoch, so a delayed check can tell whether the app
/// stayed hidden the whole time or was shown and hidden again in between.
#[derive(Debug, Default)]
pub struct VisibilityTracker {
    hidden_since: Option<Instant>,
    epoch: u64,
}

impl VisibilityTracker {
    /// Returns the new epoch, or `None` if already hidden.
    pub fn hide(&mut self, now: Instant) -> Option<u64> {
        if self.hidden_since.is_some() {
            return None;
        }
        self.hidden_since = Some(now);
        self.epoch += 1;
        Some(self.epoch)
    }

    /// Returns how long the app was hidden, or `None` if it was visible.
    pub fn show(&mut self, now: Instant) -> Option<Duration> {
        self.hidden_since
            .take()
            .map(|since| now.saturating_duration_since(since))
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden_since.is_some()
    }

    /// Still hidden since the hide that produced `epoch`.
    pub fn is_hidden_for(&self, epoch: u64) -> bool {
        self.is_hidden() && self.epoch == epoch
    }
}
