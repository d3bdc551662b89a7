//! Timer subsystem
//!
//! A `TimerManager` keeps timers ordered by `(deadline, id)` in a single
//! `BTreeMap` behind a read/write lock. The owner (the IoManager) polls it:
//!
//! ```text
//!   add_timer ──▶ ┌──────────────────────┐ ──front insert──▶ notifier (tickle)
//!                 │ BTreeMap<(ms, id),   │
//!   cancel ─────▶ │          Arc<Timer>> │ ◀── next_timer()  (wait bound)
//!   refresh ────▶ │                      │ ──▶ list_expired() (due callbacks)
//!                 └──────────────────────┘
//! ```
//!
//! Deadlines are milliseconds on a `Clock`. The default clock is
//! `CLOCK_MONOTONIC`; tests drive a `ManualClock`. If the clock is ever
//! seen more than an hour behind its previous reading, every pending timer
//! is treated as expired instead of stalling.

mod clock;
mod entry;
mod manager;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use entry::{Timer, TimerCallback};
pub use manager::TimerManager;
