//! Deadline-ordered timer set

use super::clock::{Clock, MonotonicClock};
use super::entry::{Timer, TimerCallback, TimerKey};
use gvfiber_core::constants::ROLLOVER_THRESHOLD_MS;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

type Notifier = Box<dyn Fn() + Send + Sync>;

struct TimerSet {
    timers: BTreeMap<TimerKey, Arc<Timer>>,
    /// Last "now" seen by `list_expired`, for rollover detection
    previous_ms: u64,
}

pub(super) struct Shared {
    set: RwLock<TimerSet>,
    /// A front-insert notification is in flight; cleared by `next_timer`
    tickled: AtomicBool,
    notifier: OnceLock<Notifier>,
    clock: Arc<dyn Clock>,
}

/// Ordered collection of timers
///
/// Cheap to share: timers keep a weak reference back to the same set.
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let previous_ms = clock.now_ms();
        TimerManager {
            shared: Arc::new(Shared {
                set: RwLock::new(TimerSet {
                    timers: BTreeMap::new(),
                    previous_ms,
                }),
                tickled: AtomicBool::new(false),
                notifier: OnceLock::new(),
                clock,
            }),
        }
    }

    /// Install the callback run when a timer becomes the earliest one.
    ///
    /// It runs outside the set's lock. Only the first call takes effect.
    pub fn set_front_notifier<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.shared.notifier.set(Box::new(f)).is_err() {
            tracing::warn!("timer front notifier already installed");
        }
    }

    /// Current time on this manager's clock
    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// Run `cb` after `ms` milliseconds, every `ms` if `recurring`.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let deadline = self.now_ms().saturating_add(ms);
        let timer = Arc::new(Timer::new(
            ms,
            deadline,
            Arc::new(cb),
            recurring,
            Arc::downgrade(&self.shared),
        ));
        let set = self.shared.set.write();
        self.shared.insert(set, timer.clone());
        timer
    }

    /// Like `add_timer`, but the callback only runs while `cond` is alive.
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline (0 if overdue), `None` if empty.
    pub fn next_timer(&self) -> Option<u64> {
        self.shared.tickled.store(false, Ordering::Release);
        let set = self.shared.set.read();
        let &(deadline, _) = set.timers.keys().next()?;
        Some(deadline.saturating_sub(self.now_ms()))
    }

    /// Move the callbacks of every due timer into `out`.
    ///
    /// Recurring timers are re-inserted with a fresh deadline; the others
    /// are spent. A clock rollover expires everything.
    pub fn list_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = self.now_ms();
        if self.shared.set.read().timers.is_empty() {
            return;
        }

        let mut set = self.shared.set.write();
        if set.timers.is_empty() {
            return;
        }

        let rollover = detect_rollover(&mut set.previous_ms, now);
        if !rollover && set.timers.keys().next().is_some_and(|&(d, _)| d > now) {
            return;
        }

        let expired = if rollover {
            std::mem::take(&mut set.timers)
        } else {
            let later = set.timers.split_off(&(now.saturating_add(1), 0));
            std::mem::replace(&mut set.timers, later)
        };

        out.reserve(expired.len());
        for (_, timer) in expired {
            let mut slot = timer.slot.lock();
            let Some(cb) = slot.callback.clone() else {
                continue;
            };
            out.push(cb);
            if timer.is_recurring() {
                slot.deadline_ms = now.saturating_add(slot.interval_ms);
                let key = (slot.deadline_ms, timer.id());
                drop(slot);
                set.timers.insert(key, timer);
            } else {
                slot.callback = None;
            }
        }
    }

    /// Any timer pending
    pub fn has_timer(&self) -> bool {
        !self.shared.set.read().timers.is_empty()
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.shared.set.read().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("pending", &self.len())
            .finish()
    }
}

/// True if `now` is more than the threshold behind the previous reading.
fn detect_rollover(previous_ms: &mut u64, now: u64) -> bool {
    let rollover = previous_ms
        .checked_sub(ROLLOVER_THRESHOLD_MS)
        .is_some_and(|limit| now < limit);
    if rollover {
        tracing::warn!(previous_ms = *previous_ms, now_ms = now, "clock rolled back, expiring all timers");
    }
    *previous_ms = now;
    rollover
}

impl Shared {
    /// Insert under the write lock; notify (after unlocking) if the timer
    /// became the earliest and no notification is pending.
    fn insert(&self, mut set: RwLockWriteGuard<'_, TimerSet>, timer: Arc<Timer>) {
        let key = timer.key();
        set.timers.insert(key, timer);
        let at_front = set.timers.keys().next() == Some(&key);
        let notify = at_front && !self.tickled.swap(true, Ordering::AcqRel);
        drop(set);

        if notify {
            if let Some(notifier) = self.notifier.get() {
                notifier();
            }
        }
    }

    pub(super) fn cancel(&self, timer: &Timer) -> bool {
        let mut set = self.set.write();
        let mut slot = timer.slot.lock();
        if slot.callback.take().is_none() {
            return false;
        }
        set.timers.remove(&(slot.deadline_ms, timer.id()));
        true
    }

    pub(super) fn refresh(&self, timer: &Timer) -> bool {
        let now = self.clock.now_ms();
        let mut set = self.set.write();
        let mut slot = timer.slot.lock();
        if slot.callback.is_none() {
            return false;
        }
        let Some(entry) = set.timers.remove(&(slot.deadline_ms, timer.id())) else {
            return false;
        };
        slot.deadline_ms = now.saturating_add(slot.interval_ms);
        set.timers.insert((slot.deadline_ms, timer.id()), entry);
        true
    }

    pub(super) fn reset(&self, timer: &Timer, interval_ms: u64, from_now: bool) -> bool {
        let now = self.clock.now_ms();
        let mut set = self.set.write();
        let entry = {
            let mut slot = timer.slot.lock();
            if interval_ms == slot.interval_ms && !from_now {
                return true;
            }
            if slot.callback.is_none() {
                return false;
            }
            let Some(entry) = set.timers.remove(&(slot.deadline_ms, timer.id())) else {
                return false;
            };
            let start = if from_now {
                now
            } else {
                slot.deadline_ms.saturating_sub(slot.interval_ms)
            };
            slot.interval_ms = interval_ms;
            slot.deadline_ms = start.saturating_add(interval_ms);
            entry
        };
        self.insert(set, entry);
        true
    }
}
