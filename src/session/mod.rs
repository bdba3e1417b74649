pub mod controller;
pub mod visibility;

pub use controller::{SessionController, SessionServices, BACKGROUND_PAUSE_NOTICE};
pub use visibility::VisibilityTracker;
