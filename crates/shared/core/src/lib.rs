//! Cadence Core Domain
//!
//! Pure domain types for the Cadence time synchronization toolkit.
//! This crate contains no async, no I/O, and is 100% unit testable.

pub mod grid;
pub mod playback;
pub mod values;

// Re-export commonly used types at crate root
pub use grid::FrameGrid;
pub use playback::{EventMask, KeeperEvent, PlayDirection, PlayMode};
pub use values::{Seconds, WallTime};
