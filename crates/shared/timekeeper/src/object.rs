//! Time objects: the per-client side of time synchronization.
//!
//! A [`TimeObject`] represents one time-dependent client (an animated
//! graphic, a probe, a recorder). It holds the last time value pushed to it,
//! an update policy describing when it wants callbacks, and an ordered
//! callback registry. The owning [`TimeKeeper`](crate::TimeKeeper) decides
//! *when* each object fires; the object only answers "given a reference
//! time, when is my next callback due?".

use cadence_core::{FrameGrid, PlayDirection, Seconds};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{Result, TimeSyncError};
use crate::keeper::TimeKeeper;

/// Default callback frequency for regular objects (callbacks per second)
pub const DEFAULT_FREQUENCY: f64 = 10.0;

/// Identity handle for a registered callback
///
/// Returned by `add_callback`; the only way to remove a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub(crate) u64);

/// Callback invoked when the owning keeper pushes a new time to the object
pub type TimeCallback = Arc<dyn Fn(Seconds) + Send + Sync>;

/// Externally supplied "next callback time" function
///
/// Called as `(after, direction)`; must return the next time the object
/// wants a callback, strictly beyond `after` in `direction`. The keeper
/// trusts the result; a non-advancing value is logged and used as-is.
pub type NextTimeFn = Arc<dyn Fn(Seconds, PlayDirection) -> Seconds + Send + Sync>;

/// When an object wants its callbacks
enum UpdatePolicy {
    /// On a frequency/offset grid
    Regular(FrameGrid),
    /// Wherever the supplied function says
    Custom(NextTimeFn),
}

struct ObjectState {
    current_time: Seconds,
    policy: UpdatePolicy,
    callbacks: Vec<(CallbackId, TimeCallback)>,
    owner: Weak<TimeKeeper>,
}

/// One time-dependent client of a time keeper
///
/// Created detached; attached to at most one keeper at a time via
/// [`TimeKeeper::add_time_object`](crate::TimeKeeper::add_time_object).
/// Dropping the object releases its callbacks without invoking them.
pub struct TimeObject {
    /// Debug/display name only
    name: Option<String>,
    state: Mutex<ObjectState>,
    next_callback_id: AtomicU64,
}

impl TimeObject {
    fn build(name: Option<String>, grid: FrameGrid) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(ObjectState {
                current_time: 0.0,
                policy: UpdatePolicy::Regular(grid),
                callbacks: Vec::new(),
                owner: Weak::new(),
            }),
            next_callback_id: AtomicU64::new(0),
        })
    }

    /// Create a regular object firing on a frequency/offset grid
    pub fn regular(frequency: f64, offset: Seconds) -> Result<Arc<Self>> {
        let grid =
            FrameGrid::new(frequency, offset).ok_or(TimeSyncError::InvalidFrequency(frequency))?;
        Ok(Self::build(None, grid))
    }

    /// Create a regular object with the default frequency (10 Hz, no offset)
    pub fn with_default_frequency() -> Arc<Self> {
        let grid = FrameGrid::new(DEFAULT_FREQUENCY, 0.0).expect("default grid is valid");
        Self::build(None, grid)
    }

    /// Create a named regular object (name is debug/display only)
    pub fn named(name: impl Into<String>, frequency: f64, offset: Seconds) -> Result<Arc<Self>> {
        let grid =
            FrameGrid::new(frequency, offset).ok_or(TimeSyncError::InvalidFrequency(frequency))?;
        Ok(Self::build(Some(name.into()), grid))
    }

    /// The object's debug name, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The last time value pushed to this object
    pub fn current_time(&self) -> Seconds {
        self.state.lock().current_time
    }

    /// Switch the object to an externally supplied next-time function
    ///
    /// Fails with `AlreadyAttached` if the object is currently driving a
    /// keeper: the update policy is fixed while attached.
    pub fn set_next_time_function<F>(&self, function: F) -> Result<()>
    where
        F: Fn(Seconds, PlayDirection) -> Seconds + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        if state.owner.upgrade().is_some() {
            return Err(TimeSyncError::AlreadyAttached);
        }
        state.policy = UpdatePolicy::Custom(Arc::new(function));
        Ok(())
    }

    /// The next time this object wants a callback, strictly beyond `after`
    /// in `direction`
    pub fn next_callback_time(&self, after: Seconds, direction: PlayDirection) -> Seconds {
        // Custom functions are user code: never invoke them under our lock.
        let custom = {
            let state = self.state.lock();
            match &state.policy {
                UpdatePolicy::Regular(grid) => return grid.next_in_direction(after, direction),
                UpdatePolicy::Custom(function) => function.clone(),
            }
        };
        custom(after, direction)
    }

    /// Whether `t` is exactly a callback time for this object
    ///
    /// Only consulted when a loop wrap lands exactly on a bound, to decide
    /// whether the object sitting at the wrap instant gets an edge callback.
    /// For a custom function the answer is a self-consistency probe: step
    /// away from `t` against `direction`, step back, and require the
    /// function to return to `t`.
    pub fn is_valid_callback_time(&self, t: Seconds, direction: PlayDirection) -> bool {
        let custom = {
            let state = self.state.lock();
            match &state.policy {
                UpdatePolicy::Regular(grid) => return grid.contains(t),
                UpdatePolicy::Custom(function) => function.clone(),
            }
        };
        let previous = custom(t, direction.reversed());
        let roundtrip = custom(previous, direction);
        (roundtrip - t).abs() < 1e-9 * t.abs().max(1.0)
    }

    /// Register a callback; fired every time the owning keeper pushes a new
    /// time to this object, in registration order
    ///
    /// Duplicate registrations are allowed and fire once each. The callback
    /// must not block: the keeper's scheduling loop waits for it.
    pub fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(Seconds) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed));
        self.state.lock().callbacks.push((id, Arc::new(callback)));
        id
    }

    /// Remove a previously registered callback
    pub fn remove_callback(&self, id: CallbackId) -> Result<()> {
        let mut state = self.state.lock();
        match state.callbacks.iter().position(|(cb_id, _)| *cb_id == id) {
            Some(index) => {
                state.callbacks.remove(index);
                Ok(())
            }
            None => Err(TimeSyncError::CallbackNotFound),
        }
    }

    /// Number of registered callbacks
    pub fn callback_count(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    /// Whether the object is currently attached to a keeper
    pub fn is_attached(&self) -> bool {
        self.state.lock().owner.upgrade().is_some()
    }

    // --- keeper-privileged operations (crate-private) ---

    /// Store a new current time without firing callbacks
    pub(crate) fn set_current_time(&self, t: Seconds) {
        self.state.lock().current_time = t;
    }

    /// Invoke every registered callback, in order, with the current time
    ///
    /// Fire-and-forget: callbacks run with no locks held and nothing is
    /// caught.
    pub(crate) fn notify_clients(&self) {
        let (time, callbacks) = {
            let state = self.state.lock();
            (
                state.current_time,
                state
                    .callbacks
                    .iter()
                    .map(|(_, cb)| cb.clone())
                    .collect::<Vec<_>>(),
            )
        };
        for callback in callbacks {
            callback(time);
        }
    }

    /// Record `keeper` as the owner; fails if another live keeper owns us
    pub(crate) fn bind(&self, keeper: &Arc<TimeKeeper>) -> Result<()> {
        let mut state = self.state.lock();
        if state.owner.upgrade().is_some() {
            return Err(TimeSyncError::AlreadyAttached);
        }
        state.owner = Arc::downgrade(keeper);
        Ok(())
    }

    /// Clear the back-reference; fails unless `keeper` is the current owner
    pub(crate) fn unbind_from(&self, keeper: &Arc<TimeKeeper>) -> Result<()> {
        let mut state = self.state.lock();
        match state.owner.upgrade() {
            Some(owner) if Arc::ptr_eq(&owner, keeper) => {
                state.owner = Weak::new();
                Ok(())
            }
            _ => Err(TimeSyncError::NotAttached),
        }
    }

    /// Unconditionally clear the back-reference (keeper teardown)
    pub(crate) fn clear_owner(&self) {
        self.state.lock().owner = Weak::new();
    }
}

impl std::fmt::Debug for TimeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeObject")
            .field("name", &self.name)
            .field("current_time", &self.current_time())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_next_callback_time() {
        let object = TimeObject::regular(10.0, 0.0).unwrap();
        let next = object.next_callback_time(0.23, PlayDirection::Forward);
        assert!((next - 0.3).abs() < 1e-12);
        let prev = object.next_callback_time(0.3, PlayDirection::Backward);
        assert!((prev - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_default_frequency() {
        let object = TimeObject::with_default_frequency();
        let next = object.next_callback_time(0.0, PlayDirection::Forward);
        assert!((next - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_zero_frequency() {
        assert_eq!(
            TimeObject::regular(0.0, 0.0).unwrap_err(),
            TimeSyncError::InvalidFrequency(0.0)
        );
    }

    #[test]
    fn test_custom_next_time_function() {
        let object = TimeObject::regular(10.0, 0.0).unwrap();
        object
            .set_next_time_function(|after, direction| match direction {
                PlayDirection::Forward => after + 0.5,
                PlayDirection::Backward => after - 0.5,
            })
            .unwrap();

        let next = object.next_callback_time(1.0, PlayDirection::Forward);
        assert!((next - 1.5).abs() < 1e-12);
        let prev = object.next_callback_time(1.0, PlayDirection::Backward);
        assert!((prev - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_custom_validity_probe() {
        let object = TimeObject::regular(10.0, 0.0).unwrap();
        // Steps of 0.5 anchored at 0: every multiple of 0.5 round-trips.
        object
            .set_next_time_function(|after, direction| {
                let grid = FrameGrid::new(2.0, 0.0).unwrap();
                grid.next_in_direction(after, direction)
            })
            .unwrap();

        assert!(object.is_valid_callback_time(1.5, PlayDirection::Forward));
        assert!(!object.is_valid_callback_time(1.3, PlayDirection::Forward));
    }

    #[test]
    fn test_grid_validity() {
        let object = TimeObject::regular(10.0, 0.0).unwrap();
        assert!(object.is_valid_callback_time(0.3, PlayDirection::Forward));
        assert!(!object.is_valid_callback_time(0.25, PlayDirection::Forward));
    }

    #[test]
    fn test_callbacks_fire_in_order() {
        let object = TimeObject::regular(10.0, 0.0).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        object.add_callback(move |t| o1.lock().push((1, t)));
        let o2 = order.clone();
        object.add_callback(move |t| o2.lock().push((2, t)));

        object.set_current_time(4.2);
        object.notify_clients();

        let seen = order.lock().clone();
        assert_eq!(seen, vec![(1, 4.2), (2, 4.2)]);
    }

    #[test]
    fn test_duplicate_callbacks_fire_once_each() {
        let object = TimeObject::regular(10.0, 0.0).unwrap();
        let count = Arc::new(AtomicU64::new(0));

        for _ in 0..2 {
            let c = count.clone();
            object.add_callback(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }

        object.notify_clients();
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_remove_callback() {
        let object = TimeObject::regular(10.0, 0.0).unwrap();
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        let id = object.add_callback(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        object.remove_callback(id).unwrap();
        object.notify_clients();
        assert_eq!(count.load(Ordering::Relaxed), 0);

        // Second removal of the same id is an error.
        assert_eq!(
            object.remove_callback(id).unwrap_err(),
            TimeSyncError::CallbackNotFound
        );
    }

    #[test]
    fn test_set_current_time_does_not_notify() {
        let object = TimeObject::regular(10.0, 0.0).unwrap();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        object.add_callback(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        object.set_current_time(7.0);
        assert_eq!(object.current_time(), 7.0);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }
}
