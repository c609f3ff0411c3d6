//! Playback harness - runs a bounded real-time playback and records it.

use cadence_core::{EventMask, KeeperEvent, PlayDirection, PlayMode, Seconds};
use cadence_dispatch::TokioDispatcher;
use cadence_timekeeper::{Result, TimeKeeper, TimeObject};
use log::info;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Harness configuration
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Keeper name (appears in logs)
    pub name: String,
    /// Callback frequency of the recorded object (callbacks per second)
    pub frequency: f64,
    /// Grid offset of the recorded object
    pub offset: Seconds,
    /// Playback window
    pub minimum: Seconds,
    pub maximum: Seconds,
    /// Wall-clock-to-logical-time multiplier
    pub speed: f64,
    /// Initial playback direction
    pub direction: PlayDirection,
    /// Behavior at bounds
    pub mode: PlayMode,
    /// Wall-clock cap on the run; looping/swinging playback is stopped
    /// when it expires
    pub timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            name: "playback-harness".to_string(),
            frequency: 10.0,
            offset: 0.0,
            minimum: 0.0,
            maximum: 1.0,
            speed: 1.0,
            direction: PlayDirection::Forward,
            mode: PlayMode::Once,
            timeout: Duration::from_secs(5),
        }
    }
}

/// What a playback run observed
#[derive(Debug, Clone, Default)]
pub struct PlaybackReport {
    /// Every time value pushed to the recorded object, in arrival order
    pub frames: Vec<Seconds>,
    /// Every keeper-level event with the keeper time at emission
    pub events: Vec<(KeeperEvent, Seconds)>,
    /// Keeper time when the run ended
    pub final_time: Seconds,
    /// True when playback stopped on its own; false when the harness
    /// timeout cut it short
    pub completed: bool,
}

/// Real-time playback harness
///
/// Builds a keeper on a [`TokioDispatcher`], attaches one regular time
/// object that records every frame, plays to completion (or until the
/// configured timeout) and returns a [`PlaybackReport`].
pub struct PlaybackHarness {
    config: HarnessConfig,
}

impl PlaybackHarness {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    /// Run one playback to completion
    ///
    /// Must be called from within a tokio runtime.
    pub async fn run(&self) -> Result<PlaybackReport> {
        let config = &self.config;
        info!(
            "harness '{}': playback {:?} over [{}, {}] at {}x, {} Hz",
            config.name, config.direction, config.minimum, config.maximum, config.speed,
            config.frequency
        );

        let dispatcher = TokioDispatcher::new();
        let keeper = TimeKeeper::new(config.name.clone(), dispatcher)?;
        keeper.set_minimum(config.minimum)?;
        keeper.set_maximum(config.maximum)?;
        keeper.set_speed(config.speed)?;
        match config.mode {
            PlayMode::Once => keeper.set_play_once(),
            PlayMode::Loop => keeper.set_play_loop(),
            PlayMode::Swing => keeper.set_play_swing(),
        }

        let object = TimeObject::named("harness-recorder", config.frequency, config.offset)?;
        let frames = Arc::new(Mutex::new(Vec::new()));
        let frame_sink = frames.clone();
        object.add_callback(move |t| frame_sink.lock().push(t));

        let events = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(Notify::new());
        let event_sink = events.clone();
        let stop_signal = stopped.clone();
        keeper.add_callback(EventMask::all(), move |event, t| {
            event_sink.lock().push((event, t));
            if event == KeeperEvent::Stopped {
                stop_signal.notify_one();
            }
        });

        // Start from the boundary behind the playback direction.
        let start = match config.direction {
            PlayDirection::Forward => config.minimum,
            PlayDirection::Backward => config.maximum,
        };
        keeper.request_new_time(start)?;
        keeper.add_time_object(&object)?;
        keeper.play(config.direction)?;

        let completed = tokio::time::timeout(config.timeout, stopped.notified())
            .await
            .is_ok();
        if !completed {
            keeper.stop()?;
        }

        let report = PlaybackReport {
            frames: frames.lock().clone(),
            events: events.lock().clone(),
            final_time: keeper.time(),
            completed,
        };
        info!(
            "harness '{}': {} frames, final time {}, completed={}",
            config.name,
            report.frames.len(),
            report.final_time,
            report.completed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::default();
        assert_eq!(config.frequency, 10.0);
        assert_eq!(config.mode, PlayMode::Once);
        assert_eq!(config.direction, PlayDirection::Forward);
    }
}
