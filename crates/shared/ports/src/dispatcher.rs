use cadence_core::WallTime;
use std::time::Duration;

/// Handle for an armed one-shot timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Callback invoked when a one-shot timer elapses
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Port for the host event loop's timer and wall-clock facility
///
/// The time keeper never sleeps or polls; it arms at most one one-shot
/// timer at a time and resumes work when the dispatcher invokes the
/// callback. Implementations may invoke callbacks from another thread; the
/// keeper serializes internally and discards stale firings, so "same
/// thread" is not required, only that a cancelled timer never fires.
///
/// Different implementations support different environments:
/// - A tokio-backed dispatcher for real-time playback
/// - A manually advanced dispatcher for deterministic tests
pub trait EventDispatcher: Send + Sync {
    /// Current wall-clock time at microsecond granularity
    ///
    /// The epoch is implementation-defined; only differences are used.
    fn now(&self) -> WallTime;

    /// Arm a one-shot timer invoking `callback` after `delay`
    fn arm(&self, delay: Duration, callback: TimerCallback) -> TimerId;

    /// Cancel an armed timer
    ///
    /// After this returns, the timer's callback must never run. Cancelling
    /// an unknown or already-fired id is a no-op.
    fn cancel(&self, id: TimerId);

    /// Get the dispatcher's name/identifier for debugging
    fn name(&self) -> &str {
        "EventDispatcher"
    }
}
