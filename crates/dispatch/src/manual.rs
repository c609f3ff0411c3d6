//! Manually advanced dispatcher for deterministic tests.

use cadence_core::WallTime;
use cadence_ports::{EventDispatcher, TimerCallback, TimerId};
use log::trace;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct PendingTimer {
    id: TimerId,
    deadline_micros: i64,
    /// Arm order; breaks deadline ties so firing is deterministic.
    seq: u64,
    callback: TimerCallback,
}

struct Inner {
    now_micros: i64,
    pending: Vec<PendingTimer>,
}

/// Fake clock and timer queue driven explicitly by the test
///
/// Time stands still until [`advance`](Self::advance) is called; armed
/// timers fire synchronously on the advancing thread, in deadline order,
/// with the internal lock released around every callback so a firing may
/// arm or cancel timers (the scheduling loop re-arms from inside its own
/// callback).
pub struct ManualDispatcher {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl ManualDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                now_micros: 0,
                pending: Vec::new(),
            }),
            next_id: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Advance the clock by `delta`, firing every timer due on the way
    ///
    /// The clock jumps from deadline to deadline, so a callback observing
    /// `now()` sees exactly its own deadline. Timers armed by a callback
    /// fire within the same call when they fall inside the window.
    pub fn advance(&self, delta: Duration) {
        let target = {
            let inner = self.inner.lock();
            inner.now_micros + delta.as_micros() as i64
        };
        loop {
            let due = {
                let mut inner = self.inner.lock();
                let next = inner
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.deadline_micros <= target)
                    .min_by_key(|(_, t)| (t.deadline_micros, t.seq))
                    .map(|(i, _)| i);
                match next {
                    Some(index) => {
                        let timer = inner.pending.swap_remove(index);
                        inner.now_micros = inner.now_micros.max(timer.deadline_micros);
                        Some(timer)
                    }
                    None => {
                        inner.now_micros = target;
                        None
                    }
                }
            };
            match due {
                Some(timer) => {
                    trace!("manual dispatcher: firing timer {:?}", timer.id);
                    (timer.callback)();
                }
                None => break,
            }
        }
    }

    /// Advance exactly to the next pending deadline, firing it
    ///
    /// Returns how far the clock moved, or `None` when nothing is pending.
    pub fn advance_to_next(&self) -> Option<Duration> {
        let delta = {
            let inner = self.inner.lock();
            let deadline = inner.pending.iter().map(|t| t.deadline_micros).min()?;
            Duration::from_micros((deadline - inner.now_micros).max(0) as u64)
        };
        self.advance(delta);
        Some(delta)
    }

    /// Number of armed timers
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Set the clock without firing anything (simulates a wall-clock jump)
    pub fn set_now(&self, now: WallTime) {
        self.inner.lock().now_micros = now.as_micros();
    }
}

impl EventDispatcher for ManualDispatcher {
    fn now(&self) -> WallTime {
        WallTime::from_micros(self.inner.lock().now_micros)
    }

    fn arm(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let deadline_micros = inner.now_micros + delay.as_micros() as i64;
        inner.pending.push(PendingTimer {
            id,
            deadline_micros,
            seq,
            callback,
        });
        id
    }

    fn cancel(&self, id: TimerId) {
        self.inner.lock().pending.retain(|t| t.id != id);
    }

    fn name(&self) -> &str {
        "ManualDispatcher"
    }
}
