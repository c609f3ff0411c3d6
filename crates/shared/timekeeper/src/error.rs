use thiserror::Error;

/// Errors reported by time objects and time keepers
///
/// Invalid-argument and protocol-violation errors abort the operation with
/// prior state preserved. Internal scheduling inconsistencies are logged as
/// warnings and never surface here.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimeSyncError {
    #[error("Time keeper name cannot be empty")]
    EmptyName,

    #[error("Invalid update frequency: {0}")]
    InvalidFrequency(f64),

    #[error("Invalid playback speed: {0}")]
    InvalidSpeed(f64),

    #[error("Invalid time value: {0}")]
    InvalidTime(f64),

    #[error("Time object is already attached to a keeper")]
    AlreadyAttached,

    #[error("Time object is not attached to this keeper")]
    NotAttached,

    #[error("No callback registered under that id")]
    CallbackNotFound,

    #[error("Time request rejected: already notifying clients of a time change")]
    RecursiveTimeRequest,

    #[error("Playback cannot start: time is already at the playback bounds")]
    AtBounds,
}

pub type Result<T> = std::result::Result<T, TimeSyncError>;
