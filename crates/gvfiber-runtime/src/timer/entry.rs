//! Timer handle

use super::manager::Shared;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

/// Callback run when a timer expires. Recurring timers run it repeatedly.
pub type TimerCallback = std::sync::Arc<dyn Fn() + Send + Sync>;

/// Position of a timer in its manager's map
pub(super) type TimerKey = (u64, u64);

/// A pending timer
///
/// Owned by its manager's map; callers hold an `Arc<Timer>` only to
/// cancel, refresh or reset it.
pub struct Timer {
    id: u64,
    recurring: bool,
    pub(super) slot: Mutex<Slot>,
    manager: Weak<Shared>,
}

pub(super) struct Slot {
    pub interval_ms: u64,
    pub deadline_ms: u64,
    /// `None` once cancelled or fired (non-recurring)
    pub callback: Option<TimerCallback>,
}

impl Timer {
    pub(super) fn new(
        interval_ms: u64,
        deadline_ms: u64,
        callback: TimerCallback,
        recurring: bool,
        manager: Weak<Shared>,
    ) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Timer {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            slot: Mutex::new(Slot {
                interval_ms,
                deadline_ms,
                callback: Some(callback),
            }),
            manager,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    pub fn interval_ms(&self) -> u64 {
        self.slot.lock().interval_ms
    }

    pub fn deadline_ms(&self) -> u64 {
        self.slot.lock().deadline_ms
    }

    /// Still waiting to fire (or recurring and not cancelled)
    pub fn is_pending(&self) -> bool {
        self.slot.lock().callback.is_some()
    }

    pub(super) fn key(&self) -> TimerKey {
        (self.slot.lock().deadline_ms, self.id)
    }

    /// Remove the timer. True the first time, false once fired or cancelled.
    pub fn cancel(&self) -> bool {
        self.manager.upgrade().is_some_and(|m| m.cancel(self))
    }

    /// Push the deadline to now + interval.
    pub fn refresh(&self) -> bool {
        self.manager.upgrade().is_some_and(|m| m.refresh(self))
    }

    /// Change the interval, measured from now or from when the timer was armed.
    pub fn reset(&self, interval_ms: u64, from_now: bool) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|m| m.reset(self, interval_ms, from_now))
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("interval_ms", &slot.interval_ms)
            .field("deadline_ms", &slot.deadline_ms)
            .field("recurring", &self.recurring)
            .field("pending", &slot.callback.is_some())
            .finish()
    }
}
