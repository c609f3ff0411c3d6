//! Event dispatcher implementations.
//!
//! Two implementations of the [`EventDispatcher`](cadence_ports::EventDispatcher)
//! port: [`TokioDispatcher`] arms real timers on a tokio runtime for live
//! playback, and [`ManualDispatcher`] is a fake clock advanced explicitly
//! by tests, making scheduling scenarios fully deterministic.

pub mod manual;
pub mod realtime;

pub use manual::ManualDispatcher;
pub use realtime::TokioDispatcher;
