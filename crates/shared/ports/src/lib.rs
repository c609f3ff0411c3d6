//! Cadence Ports
//!
//! Port definitions (traits) for the Cadence time synchronization toolkit.
//! These define the boundary between the time core and the host
//! application's event loop.

mod dispatcher;

pub use dispatcher::{EventDispatcher, TimerCallback, TimerId};
