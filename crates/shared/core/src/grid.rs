//! Regular callback grid arithmetic.
//!
//! A [`FrameGrid`] is the set of times `offset + k / frequency` for integer
//! `k`. Regular time objects fire callbacks exactly on their grid; the
//! keeper queries the next grid point strictly beyond a reference time in
//! the current play direction.

use crate::playback::PlayDirection;
use crate::values::Seconds;

/// Tolerance for deciding whether a time sits exactly on a grid point.
const GRID_TOLERANCE: f64 = 1e-9;

/// A frequency/offset anchored time grid
///
/// `frequency` is grid points per second; `offset` shifts the whole grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameGrid {
    frequency: f64,
    offset: Seconds,
}

impl FrameGrid {
    /// Create a grid with the given frequency (points per second) and offset
    ///
    /// Returns `None` for a non-positive or non-finite frequency, or a
    /// non-finite offset.
    pub fn new(frequency: f64, offset: Seconds) -> Option<Self> {
        if !frequency.is_finite() || frequency <= 0.0 || !offset.is_finite() {
            return None;
        }
        Some(Self { frequency, offset })
    }

    /// Grid points per second
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Phase offset of the grid
    pub fn offset(&self) -> Seconds {
        self.offset
    }

    /// The next grid point strictly after `t`
    pub fn next_after(&self, t: Seconds) -> Seconds {
        self.offset + ((t - self.offset) * self.frequency + 1.0).floor() / self.frequency
    }

    /// The nearest grid point strictly before `t`
    pub fn previous_before(&self, t: Seconds) -> Seconds {
        self.offset + ((t - self.offset) * self.frequency - 1.0).ceil() / self.frequency
    }

    /// The next grid point strictly beyond `t` in the given direction
    pub fn next_in_direction(&self, t: Seconds, direction: PlayDirection) -> Seconds {
        match direction {
            PlayDirection::Forward => self.next_after(t),
            PlayDirection::Backward => self.previous_before(t),
        }
    }

    /// Whether `t` lies on the grid (within a small tolerance)
    pub fn contains(&self, t: Seconds) -> bool {
        let index = (t - self.offset) * self.frequency;
        (index - index.round()).abs() < GRID_TOLERANCE * index.abs().max(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_after_between_points() {
        let grid = FrameGrid::new(10.0, 0.0).unwrap();
        assert!((grid.next_after(0.23) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_next_after_on_point_is_strict() {
        let grid = FrameGrid::new(10.0, 0.0).unwrap();
        assert!((grid.next_after(0.3) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_previous_before() {
        let grid = FrameGrid::new(10.0, 0.0).unwrap();
        assert!((grid.previous_before(0.3) - 0.2).abs() < 1e-12);
        assert!((grid.previous_before(0.23) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_offset_anchors_grid() {
        let grid = FrameGrid::new(4.0, 0.1).unwrap();
        // Points: 0.1, 0.35, 0.6, ...
        assert!((grid.next_after(0.2) - 0.35).abs() < 1e-12);
        assert!((grid.previous_before(0.35) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_forward_backward_composition_stays_near() {
        // Forward then backward from the result lands within one spacing
        // of the original reference.
        let grid = FrameGrid::new(7.0, 0.3).unwrap();
        let spacing = 1.0 / 7.0;
        for &t in &[-2.4, -0.01, 0.0, 0.3, 1.2345, 99.9] {
            let forward = grid.next_after(t);
            let back = grid.previous_before(forward);
            assert!(
                (back - t).abs() <= spacing + 1e-9,
                "t={t}: forward={forward} back={back}"
            );
        }
    }

    #[test]
    fn test_contains() {
        let grid = FrameGrid::new(10.0, 0.0).unwrap();
        assert!(grid.contains(0.3));
        assert!(grid.contains(0.0));
        assert!(grid.contains(-1.7));
        assert!(!grid.contains(0.23));
    }

    #[test]
    fn test_contains_with_offset() {
        let grid = FrameGrid::new(2.0, 0.25).unwrap();
        assert!(grid.contains(0.25));
        assert!(grid.contains(1.75));
        assert!(!grid.contains(0.5));
    }

    #[test]
    fn test_rejects_bad_frequency() {
        assert!(FrameGrid::new(0.0, 0.0).is_none());
        assert!(FrameGrid::new(-1.0, 0.0).is_none());
        assert!(FrameGrid::new(f64::NAN, 0.0).is_none());
        assert!(FrameGrid::new(10.0, f64::INFINITY).is_none());
    }

    #[test]
    fn test_next_in_direction() {
        let grid = FrameGrid::new(10.0, 0.0).unwrap();
        assert!((grid.next_in_direction(0.23, PlayDirection::Forward) - 0.3).abs() < 1e-12);
        assert!((grid.next_in_direction(0.3, PlayDirection::Backward) - 0.2).abs() < 1e-12);
    }
}
