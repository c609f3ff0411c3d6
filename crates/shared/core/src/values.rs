//! Time value types shared across the toolkit.

/// Logical time in seconds
///
/// All animation time in Cadence is double-precision seconds. Wall-clock
/// time only enters through [`WallTime`] at the dispatcher boundary.
pub type Seconds = f64;

/// A wall-clock instant at microsecond granularity
///
/// Produced by the event dispatcher; the keeper only ever subtracts two of
/// these to measure elapsed real time, so the epoch is dispatcher-defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct WallTime {
    micros: i64,
}

impl WallTime {
    /// Create a wall-clock instant from microseconds since the dispatcher's
    /// epoch
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a wall-clock instant from whole seconds plus microseconds
    pub fn from_parts(secs: i64, micros: i64) -> Self {
        Self {
            micros: secs * 1_000_000 + micros,
        }
    }

    /// Microseconds since the dispatcher's epoch
    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    /// Elapsed time since an earlier instant, in seconds
    ///
    /// Negative if `earlier` is actually later; callers clamp where a
    /// non-negative elapsed is required.
    pub fn seconds_since(&self, earlier: WallTime) -> Seconds {
        (self.micros - earlier.micros) as f64 / 1e6
    }
}
