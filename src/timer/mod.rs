pub mod controller;
pub mod state;

pub use controller::{CountdownTimer, TimerEvent};
pub use state::{segment_index_for, CountdownState, TimerSnapshot, TimerStatus};
