//! Cadence Runner - Real-Time Playback Orchestration
//!
//! Wires the time synchronization core to a live tokio runtime:
//!
//! - **Harness**: builds a keeper, attaches a recording time object, runs a
//!   bounded playback to completion and reports what was observed
//!
//! Deterministic scheduling scenarios belong in the timekeeper's own tests
//! against the manual dispatcher; this crate exercises the real-time path.

pub mod harness;

pub use harness::{HarnessConfig, PlaybackHarness, PlaybackReport};
