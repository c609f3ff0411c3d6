//! Playback state types: direction, mode, and keeper-level events.

use bitflags::bitflags;

/// Direction of playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayDirection {
    /// Time increases
    #[default]
    Forward,
    /// Time decreases
    Backward,
}

impl PlayDirection {
    /// Sign of time advancement: `+1.0` forward, `-1.0` backward
    pub fn signum(&self) -> f64 {
        match self {
            PlayDirection::Forward => 1.0,
            PlayDirection::Backward => -1.0,
        }
    }

    /// The opposite direction
    pub fn reversed(&self) -> Self {
        match self {
            PlayDirection::Forward => PlayDirection::Backward,
            PlayDirection::Backward => PlayDirection::Forward,
        }
    }
}

/// Behavior when playback reaches a time bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayMode {
    /// Stop at the bound
    #[default]
    Once,
    /// Wrap to the opposite bound and continue in the same direction
    Loop,
    /// Reverse direction at the bound
    Swing,
}

/// Keeper-level notification events
///
/// Delivered to keeper callbacks whose [`EventMask`] contains the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperEvent {
    /// The keeper's time changed (scheduled event or explicit request)
    NewTime,
    /// Playback started from the stopped state
    Started,
    /// Playback stopped
    Stopped,
    /// Playback direction flipped without stopping
    ChangedDirection,
    /// The minimum bound changed
    NewMinimum,
    /// The maximum bound changed
    NewMaximum,
}

bitflags! {
    /// Filter for keeper-level callbacks
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const NEW_TIME = 1 << 0;
        const STARTED = 1 << 1;
        const STOPPED = 1 << 2;
        const CHANGED_DIRECTION = 1 << 3;
        const NEW_MINIMUM = 1 << 4;
        const NEW_MAXIMUM = 1 << 5;
    }
}

impl KeeperEvent {
    /// The mask bit corresponding to this event
    pub fn mask(&self) -> EventMask {
        match self {
            KeeperEvent::NewTime => EventMask::NEW_TIME,
            KeeperEvent::Started => EventMask::STARTED,
            KeeperEvent::Stopped => EventMask::STOPPED,
            KeeperEvent::ChangedDirection => EventMask::CHANGED_DIRECTION,
            KeeperEvent::NewMinimum => EventMask::NEW_MINIMUM,
            KeeperEvent::NewMaximum => EventMask::NEW_MAXIMUM,
        }
    }
}
