use tokio::time::Instant;

/// Monotonic time source used by the countdown.
///
/// Backed by `tokio::time::Instant` so paused test runtimes can drive it.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl TimeSource for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
