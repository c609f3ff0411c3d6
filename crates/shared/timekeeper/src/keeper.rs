//! The time keeper: playback state machine and real-time scheduling loop.
//!
//! A [`TimeKeeper`] owns a set of attached [`TimeObject`]s together with the
//! per-object scheduling metadata (when each object next fires — the object
//! itself only knows "what time is it"). Playback arms a single one-shot
//! timer with the injected [`EventDispatcher`] for the nearest pending
//! event; when it fires, the keeper advances wall-synchronized time,
//! updates every due object, notifies their callbacks, and re-arms.

use cadence_core::{EventMask, KeeperEvent, PlayDirection, PlayMode, Seconds, WallTime};
use cadence_ports::EventDispatcher;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::{Result, TimeSyncError};
use crate::object::{CallbackId, TimeObject};

/// Minimum armed timer delay. Keeps consecutive grid points strictly
/// ordered even when the host scheduler fires early or late.
const MIN_TIMER_DELAY: Seconds = 0.003;

/// Look-ahead used to seed the schedule of an object attached mid-playback,
/// scaled by the playback speed.
const ATTACH_LOOKAHEAD: Seconds = 0.01;

/// Tolerance when testing whether a due time fell inside the elapsed window.
const FIRE_TOLERANCE: Seconds = 1e-9;

/// Keeper-level event callback: `(event, keeper time at emission)`
pub type KeeperCallback = Arc<dyn Fn(KeeperEvent, Seconds) + Send + Sync>;

struct KeeperCallbackEntry {
    id: CallbackId,
    mask: EventMask,
    callback: KeeperCallback,
}

struct Registration {
    object: Arc<TimeObject>,
    /// Keeper-owned scheduling metadata: when this object next fires.
    next_due: Seconds,
}

struct KeeperState {
    time: Seconds,
    /// Continuously integrated wall-synchronized time; diverges from `time`
    /// only mid-event-batch, reconciled before events are emitted.
    real_time: Seconds,
    direction: PlayDirection,
    mode: PlayMode,
    minimum: Option<Seconds>,
    maximum: Option<Seconds>,
    speed: f64,
    play_every_frame: bool,
    playing: bool,
    /// A final partial step to land exactly on a bound is in flight.
    play_remaining: bool,
    /// Logical step the pending timer was armed for (used verbatim as the
    /// elapsed time in every-frame mode).
    step: Seconds,
    /// Wall clock at the last arm/fire.
    last_wall: WallTime,
    timer: Option<cadence_ports::TimerId>,
    /// Bumped on every cancel/arm; a firing with a stale generation is
    /// ignored.
    generation: u64,
    registrations: Vec<Registration>,
}

/// What to do after an event batch, decided under the state lock but acted
/// on outside it.
enum AfterBatch {
    Continue,
    Stop,
    Wrap,
    Swing(Seconds),
}

/// Clears the re-entrancy flag when the request cascade unwinds.
struct ClearFlag<'a>(&'a AtomicBool);

impl Drop for ClearFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The scheduler/clock coordinating multiple [`TimeObject`]s
///
/// Playback state is `{stopped, playing} x {forward, backward} x
/// {once, loop, swing}`. All operations return synchronously after at most
/// one scheduling pass; the keeper suspends by arming a one-shot timer with
/// the dispatcher and resuming when it fires.
pub struct TimeKeeper {
    name: String,
    dispatcher: Arc<dyn EventDispatcher>,
    state: Mutex<KeeperState>,
    callbacks: Mutex<Vec<KeeperCallbackEntry>>,
    next_callback_id: AtomicU64,
    /// Re-entrancy guard for `request_new_time` (per instance, not global).
    requesting: AtomicBool,
    weak: Weak<TimeKeeper>,
}

impl TimeKeeper {
    /// Create a new keeper with the given name and dispatcher
    ///
    /// The name is required and non-empty; it identifies the keeper in logs.
    pub fn new(name: impl Into<String>, dispatcher: Arc<dyn EventDispatcher>) -> Result<Arc<Self>> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TimeSyncError::EmptyName);
        }
        let initial_wall = dispatcher.now();
        Ok(Arc::new_cyclic(|weak| Self {
            name,
            dispatcher,
            state: Mutex::new(KeeperState {
                time: 0.0,
                real_time: 0.0,
                direction: PlayDirection::Forward,
                mode: PlayMode::Once,
                minimum: None,
                maximum: None,
                speed: 1.0,
                play_every_frame: false,
                playing: false,
                play_remaining: false,
                step: 0.0,
                last_wall: initial_wall,
                timer: None,
                generation: 0,
                registrations: Vec::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(0),
            requesting: AtomicBool::new(false),
            weak: weak.clone(),
        }))
    }

    /// The keeper's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current keeper time
    pub fn time(&self) -> Seconds {
        self.state.lock().time
    }

    /// Whether playback is active
    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// Current playback direction
    pub fn play_direction(&self) -> PlayDirection {
        self.state.lock().direction
    }

    /// Current behavior at bounds
    pub fn play_mode(&self) -> PlayMode {
        self.state.lock().mode
    }

    /// Wall-clock-to-logical-time multiplier
    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    /// Minimum bound, if set
    pub fn minimum(&self) -> Option<Seconds> {
        self.state.lock().minimum
    }

    /// Maximum bound, if set
    pub fn maximum(&self) -> Option<Seconds> {
        self.state.lock().maximum
    }

    /// Whether the frame-locked deterministic mode is active
    pub fn play_every_frame(&self) -> bool {
        self.state.lock().play_every_frame
    }

    /// Number of attached time objects
    pub fn object_count(&self) -> usize {
        self.state.lock().registrations.len()
    }

    // --- attachment ---

    /// Attach a time object to this keeper
    ///
    /// Fails with `AlreadyAttached` if any live keeper owns the object.
    /// On success the object is synchronously seeded with the keeper's
    /// current time (stored and notified), even when stopped. An object
    /// attached mid-playback joins the running schedule without disturbing
    /// the armed timer.
    pub fn add_time_object(self: &Arc<Self>, object: &Arc<TimeObject>) -> Result<()> {
        object.bind(self)?;

        let (time, playing, speed, direction) = {
            let s = self.state.lock();
            (s.time, s.playing, s.speed, s.direction)
        };
        let next_due = if playing {
            object.next_callback_time(
                time + ATTACH_LOOKAHEAD * speed * direction.signum(),
                direction,
            )
        } else {
            time
        };

        let arm_needed = {
            let mut s = self.state.lock();
            s.registrations.push(Registration {
                object: object.clone(),
                next_due,
            });
            s.playing && s.timer.is_none()
        };

        // Seed the new listener with the current value.
        object.set_current_time(time);
        object.notify_clients();

        if arm_needed {
            // First object attached to an already-playing keeper: nothing
            // was armed, so start its schedule now.
            let mut s = self.state.lock();
            s.last_wall = self.dispatcher.now();
            if let Err(e) = self.arm_for_soonest(&mut s) {
                debug!("time keeper '{}': cannot arm for new object: {}", self.name, e);
            }
        }
        Ok(())
    }

    /// Detach a time object
    ///
    /// Fails with `NotAttached` unless this keeper is the owner. The object
    /// receives no further callbacks. Removing the last object mid-playback
    /// leaves the keeper playing with nothing scheduled (a timer already in
    /// flight fires without effect); time resumes advancing when an object
    /// is attached again.
    pub fn remove_time_object(self: &Arc<Self>, object: &Arc<TimeObject>) -> Result<()> {
        object.unbind_from(self)?;
        let mut s = self.state.lock();
        s.registrations.retain(|r| !Arc::ptr_eq(&r.object, object));
        Ok(())
    }

    // --- playback control ---

    /// Start playback in the given direction
    ///
    /// Stopped: emits `Started`, then arms the schedule; if arming fails the
    /// keeper emits `Stopped` and stays stopped (an observable bracket, not
    /// silence). Already playing in the same direction: no-op. Already
    /// playing the other way: seamless reversal — the timer is cancelled
    /// silently, direction flips, and exactly one `ChangedDirection` is
    /// emitted.
    ///
    /// Playing from the bound ahead dispatches on the play mode: `Loop`
    /// wraps to the opposite bound, `Swing` reverses, `Once` fails with
    /// `AtBounds`.
    pub fn play(&self, direction: PlayDirection) -> Result<()> {
        let (was_playing, same_direction) = {
            let s = self.state.lock();
            (s.playing, s.direction == direction)
        };
        if was_playing && same_direction {
            return Ok(());
        }

        if was_playing {
            let cancelled = {
                let mut s = self.state.lock();
                s.generation += 1;
                s.playing = false;
                s.play_remaining = false;
                s.direction = direction;
                s.timer.take()
            };
            if let Some(id) = cancelled {
                self.dispatcher.cancel(id);
            }
            return match self.begin_playback() {
                Ok(()) => {
                    self.notify(KeeperEvent::ChangedDirection, self.time());
                    Ok(())
                }
                Err(e) => {
                    self.notify(KeeperEvent::Stopped, self.time());
                    Err(e)
                }
            };
        }

        {
            let mut s = self.state.lock();
            s.direction = direction;
        }
        self.notify(KeeperEvent::Started, self.time());
        match self.begin_playback() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.notify(KeeperEvent::Stopped, self.time());
                Err(e)
            }
        }
    }

    /// Stop playback
    ///
    /// Idempotent: stopping a stopped keeper is a no-op with no duplicate
    /// `Stopped` notification.
    pub fn stop(&self) -> Result<()> {
        let cancelled = {
            let mut s = self.state.lock();
            if !s.playing {
                return Ok(());
            }
            s.playing = false;
            s.play_remaining = false;
            s.generation += 1;
            s.timer.take()
        };
        if let Some(id) = cancelled {
            self.dispatcher.cancel(id);
        }
        self.notify(KeeperEvent::Stopped, self.time());
        Ok(())
    }

    /// Set the keeper time explicitly
    ///
    /// Rejected with `RecursiveTimeRequest` when called from inside its own
    /// callback cascade (the outer value stands). Otherwise: if playing, the
    /// timer is cancelled silently; the new time is pushed to every attached
    /// object in two phases (all `current_time` updates, then all
    /// notifications — no listener observes a mix of old and new values),
    /// `NewTime` is emitted, and playback silently resumes from the new
    /// time if it had been running.
    pub fn request_new_time(&self, t: Seconds) -> Result<()> {
        if !t.is_finite() {
            return Err(TimeSyncError::InvalidTime(t));
        }
        if self.requesting.swap(true, Ordering::SeqCst) {
            return Err(TimeSyncError::RecursiveTimeRequest);
        }
        let _guard = ClearFlag(&self.requesting);

        let (was_playing, cancelled, objects) = {
            let mut s = self.state.lock();
            let was = s.playing;
            let cancelled = s.timer.take();
            if was {
                s.generation += 1;
                s.playing = false;
                s.play_remaining = false;
            }
            s.time = t;
            s.real_time = t;
            let objects: Vec<_> = s.registrations.iter().map(|r| r.object.clone()).collect();
            (was, cancelled, objects)
        };
        if let Some(id) = cancelled {
            self.dispatcher.cancel(id);
        }

        for object in &objects {
            object.set_current_time(t);
        }
        for object in &objects {
            object.notify_clients();
        }
        self.notify(KeeperEvent::NewTime, t);

        if was_playing {
            if let Err(e) = self.begin_playback() {
                self.notify(KeeperEvent::Stopped, self.time());
                return Err(e);
            }
        }
        Ok(())
    }

    // --- bounds, speed, mode ---

    /// Set the minimum bound and emit `NewMinimum`
    ///
    /// No `minimum <= maximum` validation is performed; a keeper with
    /// inverted bounds simply has no playable window and `play` fails.
    pub fn set_minimum(&self, v: Seconds) -> Result<()> {
        if !v.is_finite() {
            return Err(TimeSyncError::InvalidTime(v));
        }
        {
            let mut s = self.state.lock();
            s.minimum = Some(v);
        }
        self.notify(KeeperEvent::NewMinimum, self.time());
        Ok(())
    }

    /// Set the maximum bound and emit `NewMaximum`
    ///
    /// See [`set_minimum`](Self::set_minimum) on bound validation.
    pub fn set_maximum(&self, v: Seconds) -> Result<()> {
        if !v.is_finite() {
            return Err(TimeSyncError::InvalidTime(v));
        }
        {
            let mut s = self.state.lock();
            s.maximum = Some(v);
        }
        self.notify(KeeperEvent::NewMaximum, self.time());
        Ok(())
    }

    /// Set the wall-clock-to-logical-time multiplier
    pub fn set_speed(&self, v: f64) -> Result<()> {
        if !v.is_finite() || v <= 0.0 {
            return Err(TimeSyncError::InvalidSpeed(v));
        }
        self.state.lock().speed = v;
        Ok(())
    }

    /// Use the armed logical step as the elapsed time on every fire
    /// (deterministic, frame-locked; trades timing fidelity for
    /// reproducibility)
    pub fn set_play_every_frame(&self) {
        self.state.lock().play_every_frame = true;
    }

    /// Use measured wall-clock elapsed time on every fire (default)
    pub fn set_play_skip_frames(&self) {
        self.state.lock().play_every_frame = false;
    }

    /// Stop at bounds
    pub fn set_play_once(&self) {
        self.state.lock().mode = PlayMode::Once;
    }

    /// Wrap to the opposite bound and continue
    pub fn set_play_loop(&self) {
        self.state.lock().mode = PlayMode::Loop;
    }

    /// Reverse direction at bounds
    pub fn set_play_swing(&self) {
        self.state.lock().mode = PlayMode::Swing;
    }

    // --- keeper-level callbacks ---

    /// Register a keeper-level callback for the events in `mask`
    pub fn add_callback<F>(&self, mask: EventMask, callback: F) -> CallbackId
    where
        F: Fn(KeeperEvent, Seconds) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push(KeeperCallbackEntry {
            id,
            mask,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a keeper-level callback
    pub fn remove_callback(&self, id: CallbackId) -> Result<()> {
        let mut callbacks = self.callbacks.lock();
        match callbacks.iter().position(|entry| entry.id == id) {
            Some(index) => {
                callbacks.remove(index);
                Ok(())
            }
            None => Err(TimeSyncError::CallbackNotFound),
        }
    }

    fn notify(&self, event: KeeperEvent, time: Seconds) {
        let matching: Vec<KeeperCallback> = {
            let callbacks = self.callbacks.lock();
            callbacks
                .iter()
                .filter(|entry| entry.mask.contains(event.mask()))
                .map(|entry| entry.callback.clone())
                .collect()
        };
        for callback in matching {
            callback(event, time);
        }
    }

    // --- scheduling internals ---

    /// Start the schedule, dispatching on the play mode when the keeper
    /// already sits at the bound ahead
    ///
    /// `Loop` wraps to the opposite bound and resumes; `Swing` reverses
    /// direction (emitting `ChangedDirection`); `Once` fails with
    /// `AtBounds`.
    fn begin_playback(&self) -> Result<()> {
        match self.start_playing() {
            Err(TimeSyncError::AtBounds) => {
                let mode = self.state.lock().mode;
                match mode {
                    PlayMode::Once => Err(TimeSyncError::AtBounds),
                    PlayMode::Loop => self.wrap_playback(),
                    PlayMode::Swing => {
                        let original = {
                            let mut s = self.state.lock();
                            let original = s.direction;
                            s.direction = original.reversed();
                            original
                        };
                        match self.start_playing() {
                            Ok(()) => {
                                self.notify(KeeperEvent::ChangedDirection, self.time());
                                Ok(())
                            }
                            Err(e) => {
                                self.state.lock().direction = original;
                                Err(e)
                            }
                        }
                    }
                }
            }
            other => other,
        }
    }

    /// (Re)compute every object's next due time from the current keeper
    /// time and arm the first timer. Does not notify anything.
    fn start_playing(&self) -> Result<()> {
        // Next-time functions are user code: compute dues outside the lock.
        let (time, direction, objects) = {
            let s = self.state.lock();
            let objects: Vec<_> = s.registrations.iter().map(|r| r.object.clone()).collect();
            (s.time, s.direction, objects)
        };
        let dues: Vec<Seconds> = objects
            .iter()
            .map(|o| o.next_callback_time(time, direction))
            .collect();

        let mut s = self.state.lock();
        s.real_time = s.time;
        for (object, due) in objects.iter().zip(dues) {
            if let Some(reg) = s
                .registrations
                .iter_mut()
                .find(|r| Arc::ptr_eq(&r.object, object))
            {
                reg.next_due = due;
            }
        }
        s.play_remaining = false;
        s.last_wall = self.dispatcher.now();
        self.arm_for_soonest(&mut s)?;
        s.playing = true;
        debug!(
            "time keeper '{}': playback armed from {} ({:?})",
            self.name, s.time, s.direction
        );
        Ok(())
    }

    /// Arm a one-shot timer for the nearest pending due time
    ///
    /// When the nearest due crosses a set bound, arms a final partial step
    /// landing exactly on the bound instead (`play_remaining`); fails with
    /// `AtBounds` when the keeper already sits at or beyond the bound.
    /// With no attached objects nothing is armed and time does not advance.
    fn arm_for_soonest(&self, s: &mut KeeperState) -> Result<()> {
        let soonest = match s.direction {
            PlayDirection::Forward => s
                .registrations
                .iter()
                .map(|r| r.next_due)
                .fold(None, |acc: Option<f64>, d| {
                    Some(acc.map_or(d, |a| a.min(d)))
                }),
            PlayDirection::Backward => s
                .registrations
                .iter()
                .map(|r| r.next_due)
                .fold(None, |acc: Option<f64>, d| {
                    Some(acc.map_or(d, |a| a.max(d)))
                }),
        };
        let Some(mut due) = soonest else {
            s.timer = None;
            debug!("time keeper '{}': no objects to schedule", self.name);
            return Ok(());
        };

        let bound = match s.direction {
            PlayDirection::Forward => s.maximum,
            PlayDirection::Backward => s.minimum,
        };
        if let Some(bound) = bound {
            let crossed = match s.direction {
                PlayDirection::Forward => due > bound,
                PlayDirection::Backward => due < bound,
            };
            if crossed {
                let inside = match s.direction {
                    PlayDirection::Forward => s.real_time < bound,
                    PlayDirection::Backward => s.real_time > bound,
                };
                if inside {
                    // Final partial step: land exactly on the bound.
                    s.play_remaining = true;
                    due = bound;
                } else {
                    return Err(TimeSyncError::AtBounds);
                }
            }
        }

        let logical = (due - s.real_time) * s.direction.signum();
        let consumed = self.dispatcher.now().seconds_since(s.last_wall).max(0.0);
        let delay = (logical / s.speed - consumed).max(MIN_TIMER_DELAY);
        s.step = logical;
        s.generation += 1;
        let generation = s.generation;
        let weak = self.weak.clone();
        let id = self.dispatcher.arm(
            Duration::from_secs_f64(delay),
            Box::new(move || {
                if let Some(keeper) = weak.upgrade() {
                    keeper.on_timer(generation);
                }
            }),
        );
        s.timer = Some(id);
        Ok(())
    }

    /// Handle a timer firing: advance time, fire due objects, re-arm.
    fn on_timer(&self, generation: u64) {
        struct Fired {
            object: Arc<TimeObject>,
            due: Seconds,
        }

        let (fired, event_time, hit_bound, direction, mode) = {
            let mut s = self.state.lock();
            if !s.playing || generation != s.generation {
                // Cancelled or superseded while the firing was in flight.
                return;
            }
            s.timer = None;

            let now = self.dispatcher.now();
            let wall_elapsed = now.seconds_since(s.last_wall).max(0.0);
            s.last_wall = now;
            let elapsed = if s.play_every_frame {
                s.step
            } else {
                wall_elapsed * s.speed
            };
            s.real_time += elapsed * s.direction.signum();

            // Clamp to a reached bound.
            let mut bound_hit = None;
            match s.direction {
                PlayDirection::Forward => {
                    if let Some(max) = s.maximum {
                        if s.real_time >= max {
                            s.real_time = max;
                            bound_hit = Some(max);
                        }
                    }
                }
                PlayDirection::Backward => {
                    if let Some(min) = s.minimum {
                        if s.real_time <= min {
                            s.real_time = min;
                            bound_hit = Some(min);
                        }
                    }
                }
            }
            s.time = s.real_time;

            let mut batch = Vec::new();
            for reg in &s.registrations {
                let within = match s.direction {
                    PlayDirection::Forward => reg.next_due <= s.time + FIRE_TOLERANCE,
                    PlayDirection::Backward => reg.next_due >= s.time - FIRE_TOLERANCE,
                };
                let in_bounds = match s.direction {
                    PlayDirection::Forward => s
                        .maximum
                        .map_or(true, |max| reg.next_due <= max + FIRE_TOLERANCE),
                    PlayDirection::Backward => s
                        .minimum
                        .map_or(true, |min| reg.next_due >= min - FIRE_TOLERANCE),
                };
                if within && in_bounds {
                    batch.push(Fired {
                        object: reg.object.clone(),
                        due: reg.next_due,
                    });
                }
            }

            // Listeners only ever observe exact callback times: snap to the
            // canonical event time of this batch.
            if !batch.is_empty() {
                let canonical = match s.direction {
                    PlayDirection::Forward => {
                        batch.iter().map(|f| f.due).fold(f64::INFINITY, f64::min)
                    }
                    PlayDirection::Backward => {
                        batch.iter().map(|f| f.due).fold(f64::NEG_INFINITY, f64::max)
                    }
                };
                s.time = canonical;
            }

            (batch, s.time, bound_hit, s.direction, s.mode)
        };

        // Two-phase update: every object's time is stored before any
        // object's clients are notified.
        for f in &fired {
            f.object.set_current_time(f.due);
        }
        for f in &fired {
            f.object.notify_clients();
        }

        // Recompute each fired object's next due from the time it fired at.
        let new_dues: Vec<(Arc<TimeObject>, Seconds)> = fired
            .iter()
            .map(|f| {
                let next = f.object.next_callback_time(f.due, direction);
                let advancing = match direction {
                    PlayDirection::Forward => next > f.due,
                    PlayDirection::Backward => next < f.due,
                };
                if !advancing {
                    warn!(
                        "time keeper '{}': object {:?} returned non-advancing next callback time {} (from {})",
                        self.name,
                        f.object.name(),
                        next,
                        f.due
                    );
                }
                (f.object.clone(), next)
            })
            .collect();

        // A batch can be empty (an object was removed after this timer was
        // armed); its time is a raw wall interpolation, not a callback
        // point, so listeners hear nothing. Landing on a bound is always
        // observable.
        if !fired.is_empty() || hit_bound.is_some() {
            self.notify(KeeperEvent::NewTime, event_time);
        }

        // Continue the schedule unless a callback stopped or re-targeted us.
        let after = {
            let mut s = self.state.lock();
            if !s.playing || generation != s.generation {
                return;
            }
            for (object, due) in new_dues {
                if let Some(reg) = s
                    .registrations
                    .iter_mut()
                    .find(|r| Arc::ptr_eq(&r.object, &object))
                {
                    reg.next_due = due;
                }
            }
            if let Some(bound) = hit_bound {
                s.play_remaining = false;
                match mode {
                    PlayMode::Once => AfterBatch::Stop,
                    PlayMode::Loop => AfterBatch::Wrap,
                    PlayMode::Swing => {
                        s.direction = s.direction.reversed();
                        s.time = bound;
                        s.real_time = bound;
                        AfterBatch::Swing(bound)
                    }
                }
            } else {
                match self.arm_for_soonest(&mut s) {
                    Ok(()) => AfterBatch::Continue,
                    Err(e) => {
                        warn!("time keeper '{}': cannot re-arm playback: {}", self.name, e);
                        AfterBatch::Stop
                    }
                }
            }
        };

        match after {
            AfterBatch::Continue => {}
            AfterBatch::Stop => {
                let _ = self.stop();
            }
            AfterBatch::Wrap => {
                if let Err(e) = self.wrap_playback() {
                    warn!(
                        "time keeper '{}': cannot resume after wrap: {}",
                        self.name, e
                    );
                    let _ = self.stop();
                }
            }
            AfterBatch::Swing(bound) => {
                self.notify(KeeperEvent::ChangedDirection, bound);
                if let Err(e) = self.start_playing() {
                    warn!(
                        "time keeper '{}': cannot resume after swing: {}",
                        self.name, e
                    );
                    let _ = self.stop();
                }
            }
        }
    }

    /// Loop-mode wrap: restart playback from the opposite bound
    ///
    /// Fails with `AtBounds` when no opposite bound is set (nowhere to wrap
    /// to) or the window is empty.
    fn wrap_playback(&self) -> Result<()> {
        let (target, direction, objects) = {
            let s = self.state.lock();
            let target = match s.direction {
                PlayDirection::Forward => s.minimum,
                PlayDirection::Backward => s.maximum,
            };
            let objects: Vec<_> = s.registrations.iter().map(|r| r.object.clone()).collect();
            (target, s.direction, objects)
        };
        let Some(target) = target else {
            warn!(
                "time keeper '{}': loop mode with no opposite bound",
                self.name
            );
            return Err(TimeSyncError::AtBounds);
        };

        {
            let mut s = self.state.lock();
            s.time = target;
            s.real_time = target;
        }

        // An object whose schedule contains the wrap instant gets its edge
        // callback exactly once; without this the event at the bound would
        // be lost (the restarted schedule looks strictly beyond it).
        let edge: Vec<_> = objects
            .iter()
            .filter(|o| o.is_valid_callback_time(target, direction))
            .cloned()
            .collect();
        for object in &edge {
            object.set_current_time(target);
        }
        for object in &edge {
            object.notify_clients();
        }

        debug!("time keeper '{}': wrapped playback to {}", self.name, target);
        self.start_playing()
    }
}

impl Drop for TimeKeeper {
    fn drop(&mut self) {
        let mut s = self.state.lock();
        if let Some(id) = s.timer.take() {
            self.dispatcher.cancel(id);
        }
        s.playing = false;
        for reg in s.registrations.drain(..) {
            reg.object.clear_owner();
        }
    }
}

impl std::fmt::Debug for TimeKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("TimeKeeper")
            .field("name", &self.name)
            .field("time", &s.time)
            .field("playing", &s.playing)
            .field("direction", &s.direction)
            .field("mode", &s.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_dispatch::ManualDispatcher;

    fn keeper_with_dispatcher() -> (Arc<TimeKeeper>, Arc<ManualDispatcher>) {
        let dispatcher = ManualDispatcher::new();
        let keeper = TimeKeeper::new("test-keeper", dispatcher.clone()).unwrap();
        (keeper, dispatcher)
    }

    #[test]
    fn test_empty_name_rejected() {
        let dispatcher = ManualDispatcher::new();
        assert_eq!(
            TimeKeeper::new("", dispatcher).unwrap_err(),
            TimeSyncError::EmptyName
        );
    }

    #[test]
    fn test_defaults() {
        let (keeper, _) = keeper_with_dispatcher();
        assert_eq!(keeper.time(), 0.0);
        assert!(!keeper.is_playing());
        assert_eq!(keeper.play_direction(), PlayDirection::Forward);
        assert_eq!(keeper.play_mode(), PlayMode::Once);
        assert_eq!(keeper.speed(), 1.0);
        assert_eq!(keeper.minimum(), None);
        assert_eq!(keeper.maximum(), None);
    }

    #[test]
    fn test_add_seeds_object_with_current_time() {
        let (keeper, _) = keeper_with_dispatcher();
        keeper.request_new_time(2.5).unwrap();

        let object = TimeObject::regular(10.0, 0.0).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        object.add_callback(move |t| sink.lock().push(t));

        keeper.add_time_object(&object).unwrap();

        assert_eq!(object.current_time(), 2.5);
        assert_eq!(seen.lock().clone(), vec![2.5]);
    }

    #[test]
    fn test_double_attach_fails_and_preserves_lists() {
        let (keeper_a, _) = keeper_with_dispatcher();
        let dispatcher_b = ManualDispatcher::new();
        let keeper_b = TimeKeeper::new("other-keeper", dispatcher_b).unwrap();

        let object = TimeObject::regular(10.0, 0.0).unwrap();
        keeper_a.add_time_object(&object).unwrap();

        assert_eq!(
            keeper_b.add_time_object(&object).unwrap_err(),
            TimeSyncError::AlreadyAttached
        );
        assert_eq!(keeper_a.object_count(), 1);
        assert_eq!(keeper_b.object_count(), 0);
    }

    #[test]
    fn test_remove_requires_ownership() {
        let (keeper_a, _) = keeper_with_dispatcher();
        let dispatcher_b = ManualDispatcher::new();
        let keeper_b = TimeKeeper::new("other-keeper", dispatcher_b).unwrap();

        let object = TimeObject::regular(10.0, 0.0).unwrap();
        keeper_a.add_time_object(&object).unwrap();

        assert_eq!(
            keeper_b.remove_time_object(&object).unwrap_err(),
            TimeSyncError::NotAttached
        );
        assert_eq!(keeper_a.object_count(), 1);

        keeper_a.remove_time_object(&object).unwrap();
        assert!(!object.is_attached());
        assert_eq!(keeper_a.object_count(), 0);
    }

    #[test]
    fn test_reattach_after_remove() {
        let (keeper, _) = keeper_with_dispatcher();
        let object = TimeObject::regular(10.0, 0.0).unwrap();

        keeper.add_time_object(&object).unwrap();
        keeper.remove_time_object(&object).unwrap();
        keeper.add_time_object(&object).unwrap();
        assert!(object.is_attached());
    }

    #[test]
    fn test_request_new_time_two_phase() {
        let (keeper, _) = keeper_with_dispatcher();
        let object_a = TimeObject::regular(10.0, 0.0).unwrap();
        let object_b = TimeObject::regular(10.0, 0.0).unwrap();
        keeper.add_time_object(&object_a).unwrap();
        keeper.add_time_object(&object_b).unwrap();

        // Within B's callback, A must already hold the new time.
        let witness = object_a.clone();
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        object_b.add_callback(move |_| {
            *sink.lock() = Some(witness.current_time());
        });

        keeper.request_new_time(5.0).unwrap();
        assert_eq!(*observed.lock(), Some(5.0));
    }

    #[test]
    fn test_recursive_request_rejected() {
        let (keeper, _) = keeper_with_dispatcher();
        let object = TimeObject::regular(10.0, 0.0).unwrap();
        keeper.add_time_object(&object).unwrap();

        let inner = keeper.clone();
        let inner_result = Arc::new(Mutex::new(None));
        let sink = inner_result.clone();
        object.add_callback(move |_| {
            *sink.lock() = Some(inner.request_new_time(9.0));
        });

        keeper.request_new_time(3.0).unwrap();

        assert_eq!(
            *inner_result.lock(),
            Some(Err(TimeSyncError::RecursiveTimeRequest))
        );
        // Outer value stands.
        assert_eq!(keeper.time(), 3.0);
    }

    #[test]
    fn test_bounds_setters_notify() {
        let (keeper, _) = keeper_with_dispatcher();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        keeper.add_callback(EventMask::all(), move |event, _| sink.lock().push(event));

        keeper.set_minimum(0.0).unwrap();
        keeper.set_maximum(10.0).unwrap();

        assert_eq!(
            events.lock().clone(),
            vec![KeeperEvent::NewMinimum, KeeperEvent::NewMaximum]
        );
        assert_eq!(keeper.minimum(), Some(0.0));
        assert_eq!(keeper.maximum(), Some(10.0));
    }

    #[test]
    fn test_bounds_not_cross_validated() {
        // Deliberate: inverted bounds are accepted, matching the source
        // system; playback simply has no valid window.
        let (keeper, _) = keeper_with_dispatcher();
        keeper.set_minimum(10.0).unwrap();
        keeper.set_maximum(0.0).unwrap();
        assert_eq!(keeper.minimum(), Some(10.0));
        assert_eq!(keeper.maximum(), Some(0.0));
    }

    #[test]
    fn test_speed_validation() {
        let (keeper, _) = keeper_with_dispatcher();
        assert_eq!(
            keeper.set_speed(0.0).unwrap_err(),
            TimeSyncError::InvalidSpeed(0.0)
        );
        assert_eq!(
            keeper.set_speed(-2.0).unwrap_err(),
            TimeSyncError::InvalidSpeed(-2.0)
        );
        keeper.set_speed(2.5).unwrap();
        assert_eq!(keeper.speed(), 2.5);
    }

    #[test]
    fn test_event_mask_filters_notifications() {
        let (keeper, _) = keeper_with_dispatcher();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        keeper.add_callback(EventMask::NEW_MAXIMUM, move |event, _| {
            sink.lock().push(event);
        });

        keeper.set_minimum(1.0).unwrap();
        keeper.set_maximum(2.0).unwrap();

        assert_eq!(events.lock().clone(), vec![KeeperEvent::NewMaximum]);
    }

    #[test]
    fn test_remove_keeper_callback() {
        let (keeper, _) = keeper_with_dispatcher();
        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        let id = keeper.add_callback(EventMask::all(), move |_, _| {
            sink.fetch_add(1, Ordering::Relaxed);
        });

        keeper.remove_callback(id).unwrap();
        keeper.set_minimum(0.0).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(
            keeper.remove_callback(id).unwrap_err(),
            TimeSyncError::CallbackNotFound
        );
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let (keeper, _) = keeper_with_dispatcher();
        let stops = Arc::new(AtomicU64::new(0));
        let sink = stops.clone();
        keeper.add_callback(EventMask::STOPPED, move |_, _| {
            sink.fetch_add(1, Ordering::Relaxed);
        });

        keeper.stop().unwrap();
        keeper.stop().unwrap();
        assert_eq!(stops.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_play_arms_single_timer() {
        let (keeper, dispatcher) = keeper_with_dispatcher();
        let object = TimeObject::regular(10.0, 0.0).unwrap();
        keeper.add_time_object(&object).unwrap();

        keeper.play(PlayDirection::Forward).unwrap();
        assert!(keeper.is_playing());
        assert_eq!(dispatcher.pending(), 1);

        keeper.stop().unwrap();
        assert!(!keeper.is_playing());
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_play_without_objects_arms_nothing() {
        let (keeper, dispatcher) = keeper_with_dispatcher();
        keeper.play(PlayDirection::Forward).unwrap();
        assert!(keeper.is_playing());
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_keeper_drop_detaches_objects() {
        let dispatcher = ManualDispatcher::new();
        let object = TimeObject::regular(10.0, 0.0).unwrap();
        {
            let keeper = TimeKeeper::new("scoped", dispatcher.clone()).unwrap();
            keeper.add_time_object(&object).unwrap();
            assert!(object.is_attached());
        }
        assert!(!object.is_attached());
        // The object can join another keeper afterwards.
        let keeper = TimeKeeper::new("second", dispatcher).unwrap();
        keeper.add_time_object(&object).unwrap();
    }
}
