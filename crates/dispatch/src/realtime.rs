//! Tokio-backed dispatcher for real-time playback.

use cadence_core::WallTime;
use cadence_ports::{EventDispatcher, TimerCallback, TimerId};
use chrono::Utc;
use log::trace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

struct TimerSlot {
    /// Taken exactly once, by either the firing task or `cancel`.
    callback: Arc<Mutex<Option<TimerCallback>>>,
    task: JoinHandle<()>,
}

/// Real-time dispatcher arming one tokio sleep task per timer
///
/// Wall-clock time comes from the system clock at microsecond granularity.
/// Cancellation takes the callback out of its slot under a lock, so a
/// cancelled timer whose sleep already elapsed finds the slot empty and
/// does nothing.
pub struct TokioDispatcher {
    handle: Handle,
    timers: Mutex<HashMap<u64, TimerSlot>>,
    next_id: AtomicU64,
    weak: Weak<Self>,
}

impl TokioDispatcher {
    /// Create a dispatcher bound to the current tokio runtime
    ///
    /// Must be called from within a runtime; timers may then be armed from
    /// any thread.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            handle: Handle::current(),
            timers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            weak: weak.clone(),
        })
    }

    /// Number of armed timers (cancelled and fired ones are pruned)
    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }
}

impl EventDispatcher for TokioDispatcher {
    fn now(&self) -> WallTime {
        WallTime::from_micros(Utc::now().timestamp_micros())
    }

    fn arm(&self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Mutex::new(Some(callback)));

        let task_slot = slot.clone();
        let dispatcher = self.weak.clone();

        // Hold the map lock across the spawn so the task cannot observe
        // the map before its own entry is inserted.
        let mut timers = self.timers.lock();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let callback = task_slot.lock().take();
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.timers.lock().remove(&id);
            }
            if let Some(callback) = callback {
                trace!("tokio dispatcher: firing timer {}", id);
                callback();
            }
        });
        timers.insert(id, TimerSlot { callback: slot, task });
        TimerId(id)
    }

    fn cancel(&self, id: TimerId) {
        let slot = self.timers.lock().remove(&id.0);
        if let Some(slot) = slot {
            slot.callback.lock().take();
            slot.task.abort();
        }
    }

    fn name(&self) -> &str {
        "TokioDispatcher"
    }
}

impl Drop for TokioDispatcher {
    fn drop(&mut self) {
        for (_, slot) in self.timers.lock().drain() {
            slot.callback.lock().take();
            slot.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_timer_fires_after_delay() {
        let dispatcher = TokioDispatcher::new();
        let fired = Arc::new(AtomicBool::new(false));

        let f = fired.clone();
        dispatcher.arm(
            Duration::from_millis(10),
            Box::new(move || {
                f.store(true, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let dispatcher = TokioDispatcher::new();
        let fired = Arc::new(AtomicBool::new(false));

        let f = fired.clone();
        let id = dispatcher.arm(
            Duration::from_millis(10),
            Box::new(move || {
                f.store(true, Ordering::SeqCst);
            }),
        );
        dispatcher.cancel(id);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_clock_advances() {
        let dispatcher = TokioDispatcher::new();
        let before = dispatcher.now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after = dispatcher.now();
        assert!(after.seconds_since(before) > 0.0);
    }
}
