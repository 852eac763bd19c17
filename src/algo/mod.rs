pub mod rolling;

// Re-exports for convenience
pub use rolling::{RollingWindow, WINDOW_CAPACITY};
