//! Time synchronization core: time objects and the time keeper.
//!
//! The keeper is the scheduler/clock; objects are its clients. Playback
//! advances a wall-clock-synchronized time value, fires each object's
//! callbacks at the times its update policy asks for, and handles bounds
//! according to the play mode (stop, loop, or swing). Timer facilities are
//! injected through the [`EventDispatcher`](cadence_ports::EventDispatcher)
//! port, so the same core runs against real time or a manually advanced
//! test clock.

pub mod error;
pub mod keeper;
pub mod object;

pub use error::{Result, TimeSyncError};
pub use keeper::{KeeperCallback, TimeKeeper};
pub use object::{CallbackId, NextTimeFn, TimeCallback, TimeObject, DEFAULT_FREQUENCY};
