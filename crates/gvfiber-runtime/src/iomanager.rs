//! epoll reactor
//!
//! An `IoManager` is a [`Scheduler`] whose idle fiber waits in
//! `epoll_wait` instead of spinning. It owns:
//!
//! - one epoll instance, edge triggered, keyed by fd;
//! - a self-pipe so other threads can interrupt the wait (`tickle`);
//! - a [`TimerManager`] whose earliest deadline bounds the wait;
//! - one `FdContext` per fd, holding what to resume for READ and WRITE.
//!
//! ```text
//!  fiber: read() → EAGAIN → add_event(fd, READ) → yield_to_hold
//!                                                     │
//!  idle: epoll_wait ─▶ fd readable ─▶ disarm READ ─▶ schedule(fiber)
//!        └─▶ timers due ─▶ schedule(callbacks)
//! ```
//!
//! Whoever armed an event gets exactly one wakeup for it: from readiness,
//! from `cancel_event`/`cancel_all`, never both.

use crate::fiber::{Callback, Fiber};
use crate::scheduler::{Driver, Scheduler, Task};
use crate::timer::{Timer, TimerManager};
use crate::tls;
use gvfiber_core::constants::{INITIAL_FD_CONTEXTS, MAX_EVENTS, MAX_WAIT_MS};
use gvfiber_core::error::{RtResult, RuntimeError};
use gvfiber_core::{rt_assert, FiberState};
use nix::errno::Errno;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Interest set for one fd
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(libc::EPOLLIN as u32);
    pub const WRITE: Event = Event(libc::EPOLLOUT as u32);

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: Event) -> bool {
        !other.is_none() && self.0 & other.0 == other.0
    }
}

impl BitOr for Event {
    type Output = Event;
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Not for Event {
    type Output = Event;
    fn not(self) -> Event {
        Event(!self.0 & (Event::READ | Event::WRITE).0)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Event::READ), self.contains(Event::WRITE)) {
            (false, false) => f.write_str("NONE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (true, true) => f.write_str("READ|WRITE"),
        }
    }
}

/// What to resume when one direction of an fd fires
#[derive(Default)]
struct EventContext {
    /// Scheduler that gets the fiber or callback
    driver: Option<Weak<dyn Driver>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<Callback>,
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.driver.is_none() && self.fiber.is_none() && self.cb.is_none()
    }

    fn take(&mut self) -> Option<Fired> {
        let driver = self.driver.take()?;
        let task = match (self.cb.take(), self.fiber.take()) {
            (Some(cb), _) => Task::Call(cb),
            (None, Some(fiber)) => Task::Fiber(fiber),
            (None, None) => return None,
        };
        Some(Fired { driver, task })
    }
}

/// A triggered event, handed to its scheduler once the fd lock is released
struct Fired {
    driver: Weak<dyn Driver>,
    task: Task,
}

impl Fired {
    fn dispatch(self) {
        match self.driver.upgrade() {
            Some(driver) => driver.scheduler().schedule(self.task, None),
            None => tracing::error!(task = ?self.task, "event fired for a scheduler that is gone"),
        }
    }
}

struct FdEvents {
    armed: Event,
    read: EventContext,
    write: EventContext,
}

impl FdEvents {
    fn slot(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else {
            rt_assert!(event == Event::WRITE, "no slot for event {event:?}");
            &mut self.write
        }
    }

    /// Disarm `event` and take what it should resume.
    fn trigger(&mut self, event: Event) -> Option<Fired> {
        rt_assert!(self.armed.contains(event), "trigger of unarmed {event:?}");
        self.armed = self.armed & !event;
        self.slot(event).take()
    }
}

struct FdContext {
    fd: RawFd,
    events: Mutex<FdEvents>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        FdContext {
            fd,
            events: Mutex::new(FdEvents {
                armed: Event::NONE,
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }
}

/// Scheduler + epoll + timers
pub struct IoManager {
    scheduler: Scheduler,
    weak_self: Weak<IoManager>,
    epfd: OwnedFd,
    tickle_rx: OwnedFd,
    tickle_tx: OwnedFd,
    /// Armed events across all fds
    pending: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    timers: TimerManager,
}

impl IoManager {
    /// Create the reactor and start its workers.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> RtResult<Arc<IoManager>> {
        let name = name.into();
        crate::config::RuntimeConfig::new()
            .threads(threads)
            .name(name.as_str())
            .validate()?;

        // Safety: plain syscalls; every returned fd is wrapped immediately.
        let epfd = unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(RuntimeError::last_os("epoll_create1"));
            }
            OwnedFd::from_raw_fd(fd)
        };
        let (tickle_rx, tickle_tx) = unsafe {
            let mut fds = [0 as libc::c_int; 2];
            if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
                return Err(RuntimeError::last_os("pipe2"));
            }
            (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))
        };
        epoll_ctl(
            epfd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            tickle_rx.as_raw_fd(),
            libc::EPOLLIN as u32 | libc::EPOLLET as u32,
        )
        .map_err(|source| RuntimeError::Register {
            fd: tickle_rx.as_raw_fd(),
            source,
        })?;

        let iom = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let driver: Weak<dyn Driver> = weak.clone();
            let mut contexts = Vec::new();
            grow_contexts(&mut contexts, INITIAL_FD_CONTEXTS);
            IoManager {
                scheduler: Scheduler::with_driver(threads, use_caller, name, driver),
                weak_self: weak.clone(),
                epfd,
                tickle_rx,
                tickle_tx,
                pending: AtomicUsize::new(0),
                contexts: RwLock::new(contexts),
                timers: TimerManager::new(),
            }
        });

        let weak = Arc::downgrade(&iom);
        iom.timers.set_front_notifier(move || {
            if let Some(iom) = weak.upgrade() {
                iom.tickle();
            }
        });
        if use_caller {
            tls::set_current_io_manager(Some(Arc::downgrade(&iom)));
        }

        iom.scheduler.start()?;
        Ok(iom)
    }

    pub fn from_config(config: &crate::config::RuntimeConfig) -> RtResult<Arc<IoManager>> {
        Self::new(config.threads, config.use_caller, config.name.clone())
    }

    /// The IoManager this thread works for
    pub fn current() -> Option<Arc<IoManager>> {
        tls::current_io_manager()
    }

    /// Stop accepting the thread once idle and join the workers.
    ///
    /// Returns after every queued task, armed event and pending timer is done.
    pub fn stop(&self) -> RtResult<()> {
        self.scheduler.stop()
    }

    pub fn schedule(&self, task: impl Into<Task>, thread: Option<crate::thread::Tid>) {
        self.scheduler.schedule(task, thread);
    }

    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule_fn(f);
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    /// Events armed and not yet fired or removed
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Arm `event` on `fd`.
    ///
    /// When it fires, `cb` runs on the current scheduler, or, with no `cb`,
    /// the calling fiber is resumed there. Arming an event that is already
    /// armed is a fatal error.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<Callback>) -> RtResult<()> {
        rt_assert!(event == Event::READ || event == Event::WRITE, "add_event({fd}, {event:?})");
        let Some(ctx) = self.context(fd, true) else {
            return Err(RuntimeError::Register {
                fd,
                source: io::Error::from_raw_os_error(libc::EBADF),
            });
        };
        let mut ev = ctx.events.lock();
        rt_assert!(!ev.armed.contains(event), "fd {fd}: {event:?} armed twice");

        let op = if ev.armed.is_none() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mask = libc::EPOLLET as u32 | (ev.armed | event).bits();
        if let Err(source) = epoll_ctl(self.epfd.as_raw_fd(), op, fd, mask) {
            tracing::error!(fd, ?event, op, error = %source, "epoll_ctl failed");
            return Err(RuntimeError::Register { fd, source });
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        ev.armed |= event;
        let driver = tls::current_driver_weak().unwrap_or_else(|| {
            let own: Weak<dyn Driver> = self.weak_self.clone();
            own
        });
        let slot = ev.slot(event);
        rt_assert!(slot.is_empty(), "fd {fd}: stale {event:?} context");
        slot.driver = Some(driver);
        match cb {
            Some(cb) => slot.cb = Some(cb),
            None => {
                let fiber = Fiber::current();
                rt_assert!(
                    fiber.is_stackful() && fiber.state() == FiberState::Exec,
                    "fd {fd}: {event:?} armed for fiber {} in state {}",
                    fiber.id(),
                    fiber.state()
                );
                slot.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// `add_event` with a closure
    pub fn add_event_fn<F>(&self, fd: RawFd, event: Event, f: F) -> RtResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event(fd, event, Some(Box::new(f)))
    }

    /// Disarm `event` without running what it would resume.
    ///
    /// A fiber parked on it is released, so it must be woken some other way
    /// first.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context(fd, false) else {
            return false;
        };
        let dropped = {
            let mut ev = ctx.events.lock();
            if !ev.armed.contains(event) {
                return false;
            }
            let left = ev.armed & !event;
            if let Err(e) = self.rearm(fd, left) {
                tracing::error!(fd, ?event, error = %e, "epoll_ctl failed");
                return false;
            }
            self.pending.fetch_sub(1, Ordering::AcqRel);
            ev.armed = left;
            std::mem::take(ev.slot(event))
        };
        drop(dropped);
        true
    }

    /// Disarm `event` and resume what was waiting on it.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context(fd, false) else {
            return false;
        };
        let fired = {
            let mut ev = ctx.events.lock();
            if !ev.armed.contains(event) {
                return false;
            }
            let left = ev.armed & !event;
            if let Err(e) = self.rearm(fd, left) {
                tracing::error!(fd, ?event, error = %e, "epoll_ctl failed");
                return false;
            }
            self.pending.fetch_sub(1, Ordering::AcqRel);
            ev.trigger(event)
        };
        if let Some(fired) = fired {
            fired.dispatch();
        }
        true
    }

    /// Disarm everything on `fd`, resuming all waiters.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.context(fd, false) else {
            return false;
        };
        let mut fired = Vec::with_capacity(2);
        {
            let mut ev = ctx.events.lock();
            if ev.armed.is_none() {
                return false;
            }
            if let Err(e) = self.rearm(fd, Event::NONE) {
                tracing::error!(fd, error = %e, "epoll_ctl failed");
                return false;
            }
            for event in [Event::READ, Event::WRITE] {
                if ev.armed.contains(event) {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    fired.extend(ev.trigger(event));
                }
            }
            rt_assert!(ev.armed.is_none());
        }
        for f in fired {
            f.dispatch();
        }
        true
    }

    /// Context for `fd`, growing the table by half when `create` is set.
    fn context(&self, fd: RawFd, create: bool) -> Option<Arc<FdContext>> {
        let idx = usize::try_from(fd).ok()?;
        {
            let contexts = self.contexts.read();
            if let Some(ctx) = contexts.get(idx) {
                return Some(ctx.clone());
            }
            if !create {
                return None;
            }
        }
        let mut contexts = self.contexts.write();
        if idx >= contexts.len() {
            grow_contexts(&mut contexts, (idx * 3 / 2).max(idx + 1));
        }
        Some(contexts[idx].clone())
    }

    /// Re-register `fd` with the interest set `left` (DEL when empty).
    fn rearm(&self, fd: RawFd, left: Event) -> io::Result<()> {
        let op = if left.is_none() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        epoll_ctl(self.epfd.as_raw_fd(), op, fd, libc::EPOLLET as u32 | left.bits())
    }

    /// Milliseconds `idle` may block in `epoll_wait` given the next timer.
    ///
    /// A task queued before this worker was counted idle skipped the
    /// tickle, so a non-empty queue polls instead of sleeping on it.
    fn poll_timeout(&self, next: Option<u64>) -> libc::c_int {
        if self.scheduler.queued() > 0 {
            return 0;
        }
        next.map_or(MAX_WAIT_MS, |ms| ms.min(MAX_WAIT_MS)) as libc::c_int
    }

    fn drain_tickles(&self) {
        let mut buf = [0u8; 256];
        loop {
            // Safety: reading into a local buffer from our own pipe.
            let n = unsafe {
                libc::read(self.tickle_rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Handle one ready fd: disarm what fired, then resume the waiters.
    fn process_ready(&self, fd: RawFd, revents: u32) {
        let Some(ctx) = self.context(fd, false) else {
            return;
        };
        let mut fired = Vec::with_capacity(2);
        {
            let mut ev = ctx.events.lock();
            let mut real = revents;
            if real & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                real |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & ev.armed.bits();
            }
            let real = Event(real) & ev.armed;
            if real.is_none() {
                return;
            }

            let left = ev.armed & !real;
            if let Err(e) = self.rearm(fd, left) {
                tracing::error!(fd = ctx.fd, ?left, error = %e, "epoll_ctl failed");
                return;
            }
            for event in [Event::READ, Event::WRITE] {
                if real.contains(event) {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    fired.extend(ev.trigger(event));
                }
            }
        }
        for f in fired {
            f.dispatch();
        }
    }
}

impl Driver for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Wake one worker blocked in `epoll_wait`, if any is.
    fn tickle(&self) {
        if !self.scheduler.has_idle_threads() {
            return;
        }
        // Safety: one byte from a static buffer to our own pipe.
        let rc = unsafe { libc::write(self.tickle_tx.as_raw_fd(), b"T".as_ptr().cast(), 1) };
        if rc < 0 {
            let err = Errno::last();
            // A full pipe already guarantees a wakeup.
            if err != Errno::EAGAIN {
                tracing::error!(error = %err, "tickle write failed");
            }
        }
    }

    fn idle(&self) {
        tracing::debug!(scheduler = %self.scheduler.name(), "idle");
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let tickle_fd = self.tickle_rx.as_raw_fd();
        let mut expired = Vec::new();

        loop {
            let next = self.timers.next_timer();
            if next.is_none() && self.pending_event_count() == 0 && self.scheduler.base_stopping() {
                tracing::debug!(scheduler = %self.scheduler.name(), "idle exiting");
                break;
            }

            let timeout = self.poll_timeout(next);
            let n = loop {
                // Safety: `events` outlives the call and holds MAX_EVENTS entries.
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd.as_raw_fd(),
                        events.as_mut_ptr(),
                        MAX_EVENTS as libc::c_int,
                        timeout,
                    )
                };
                if rc < 0 && Errno::last() == Errno::EINTR {
                    continue;
                }
                break rc;
            };
            if n < 0 {
                tracing::error!(error = %Errno::last(), "epoll_wait failed");
            }

            self.timers.list_expired(&mut expired);
            if !expired.is_empty() {
                self.scheduler
                    .schedule_batch(expired.drain(..).map(|cb| Task::call(move || cb())));
            }

            for &event in &events[..n.max(0) as usize] {
                let fd = event.u64 as RawFd;
                if fd == tickle_fd {
                    self.drain_tickles();
                    continue;
                }
                self.process_ready(fd, event.events);
            }

            Fiber::yield_to_hold();
        }
    }

    fn stopping(&self) -> bool {
        self.timers.next_timer().is_none()
            && self.pending_event_count() == 0
            && self.scheduler.base_stopping()
    }

    fn enter_thread(&self) {
        tls::set_current_io_manager(Some(self.weak_self.clone()));
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        let pending = *self.pending.get_mut();
        if pending > 0 {
            tracing::warn!(scheduler = %self.scheduler.name(), pending, "io manager dropped with armed events");
        }
        tracing::debug!(scheduler = %self.scheduler.name(), "io manager dropped");
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("pending", &self.pending_event_count())
            .field("timers", &self.timers)
            .finish()
    }
}

fn grow_contexts(contexts: &mut Vec<Arc<FdContext>>, len: usize) {
    let start = contexts.len();
    contexts.extend((start..len).map(|fd| Arc::new(FdContext::new(fd as RawFd))));
}

fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
    let mut ev = libc::epoll_event {
        events,
        u64: fd as u64,
    };
    // Safety: `ev` is a valid epoll_event for the duration of the call.
    if unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
