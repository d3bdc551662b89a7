//! N:M fiber scheduler
//!
//! A `Scheduler` owns a FIFO of runnable units and a pool of worker threads.
//! Each worker runs the same loop:
//!
//! ```text
//!   ┌────────────── scan queue ◀─────────────────────────────┐
//!   │  skip: pinned to another thread (tickle), fiber EXEC   │
//!   ▼                                                        │
//!  unit? ──yes──▶ swap in ──▶ READY: requeue                 │
//!   │                         HOLD: someone else resumes it  │
//!   │                         TERM/EXCEPT: drop ─────────────┤
//!   no                                                       │
//!   └──▶ idle fiber (TERM ⇒ thread retires) ─────────────────┘
//! ```
//!
//! The loop itself is generic: tickling, idling and the stop condition are
//! provided by a [`Driver`]. A plain `Scheduler` is its own driver; the
//! `IoManager` embeds a scheduler and drives it with epoll.

use crate::fiber::{Callback, Fiber};
use crate::thread::{current_tid, Thread, Tid};
use crate::tls;
use gvfiber_core::error::{RtResult, RuntimeError};
use gvfiber_core::{rt_assert, FiberState};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A unit of work: a fiber to resume or a callback to run in a fiber
pub enum Task {
    Fiber(Arc<Fiber>),
    Call(Callback),
}

impl Task {
    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Task::Call(_) => f.write_str("Call"),
        }
    }
}

/// Queue entry: a task plus the thread it must run on
struct Unit {
    task: Task,
    thread: Option<Tid>,
}

/// The policy half of a scheduler
///
/// Implementors embed a [`Scheduler`] and may override how sleeping workers
/// are woken (`tickle`), what a worker does with nothing to run (`idle`)
/// and when the whole thing may shut down (`stopping`).
pub trait Driver: Send + Sync + 'static {
    fn scheduler(&self) -> &Scheduler;

    /// Wake a worker that may be idle.
    fn tickle(&self) {
        tracing::trace!(scheduler = %self.scheduler().name(), "tickle");
    }

    /// Body of each worker's idle fiber. Must yield to hold regularly and
    /// return once the driver is stopping.
    fn idle(&self) {
        tracing::debug!(scheduler = %self.scheduler().name(), "idle");
        while !self.stopping() {
            Fiber::yield_to_hold();
        }
    }

    fn stopping(&self) -> bool {
        self.scheduler().base_stopping()
    }

    /// Per-thread setup, run at the top of every worker loop.
    fn enter_thread(&self) {}
}

/// Run queue plus worker pool
pub struct Scheduler {
    name: String,
    driver: Weak<dyn Driver>,
    queue: Mutex<VecDeque<Unit>>,
    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<Tid>>,
    /// Spawned workers (the caller not included)
    thread_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    /// use_caller only: runs the worker loop on the constructing thread
    root_fiber: Option<Arc<Fiber>>,
    root_tid: Option<Tid>,
}

impl Scheduler {
    /// Create a standalone scheduler with `threads` workers.
    ///
    /// With `use_caller` the calling thread is one of them: it joins the
    /// loop when `stop()` is called.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> RtResult<Arc<Scheduler>> {
        let name = name.into();
        validate(threads, &name)?;
        Ok(Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let driver: Weak<dyn Driver> = weak.clone();
            Scheduler::with_driver(threads, use_caller, name, driver)
        }))
    }

    pub fn from_config(config: &crate::config::RuntimeConfig) -> RtResult<Arc<Scheduler>> {
        Self::new(config.threads, config.use_caller, config.name.clone())
    }

    /// Build a scheduler driven by `driver`, which must be the (not yet
    /// constructed) owner of the returned value, as inside `Arc::new_cyclic`.
    ///
    /// `threads` must be at least 1 and `name` non-empty.
    pub fn with_driver(
        threads: usize,
        use_caller: bool,
        name: impl Into<String>,
        driver: Weak<dyn Driver>,
    ) -> Scheduler {
        let name = name.into();
        rt_assert!(threads > 0, "scheduler {name} needs at least one thread");

        let mut thread_count = threads;
        let mut thread_ids = Vec::with_capacity(threads);
        let mut root_fiber = None;
        let mut root_tid = None;

        if use_caller {
            thread_count -= 1;
            // Materialize the caller's main fiber before the root fiber
            // needs somewhere to return to.
            drop(Fiber::current());

            let d = driver.clone();
            let root = Fiber::new(
                move || {
                    if let Some(driver) = d.upgrade() {
                        Scheduler::run(&driver);
                    }
                },
                0,
                true,
            );
            tls::set_scheduler_fiber(Arc::as_ptr(&root));
            tls::set_current_driver(Some(driver.clone()));

            let tid = current_tid();
            thread_ids.push(tid);
            root_tid = Some(tid);
            root_fiber = Some(root);
        }

        Scheduler {
            name,
            driver,
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(thread_ids),
            thread_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            root_fiber,
            root_tid,
        }
    }

    /// Driver of the scheduler this thread works for
    pub fn current() -> Option<Arc<dyn Driver>> {
        tls::current_driver()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Units currently being run by a worker
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Workers currently inside their idle fiber
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_count() > 0
    }

    /// Kernel tids of every worker, the caller first with use_caller
    pub fn thread_ids(&self) -> Vec<Tid> {
        self.thread_ids.lock().clone()
    }

    /// Units waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Queue `task`, optionally pinned to the worker with tid `thread`.
    pub fn schedule(&self, task: impl Into<Task>, thread: Option<Tid>) {
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(Unit {
                task: task.into(),
                thread,
            });
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Queue a callback on any worker.
    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::call(f), None);
    }

    /// Queue several tasks under one lock, tickling at most once.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator,
        I::Item: Into<Task>,
    {
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.extend(tasks.into_iter().map(|task| Unit {
                task: task.into(),
                thread: None,
            }));
            was_empty && !queue.is_empty()
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Move the calling fiber onto this scheduler, on the worker with tid
    /// `thread` if given. Returns once the fiber runs there.
    ///
    /// A no-op when already on this scheduler and on the target worker.
    pub fn switch_to(&self, thread: Option<Tid>) {
        let on_self = tls::current_driver_weak().is_some_and(|w| Weak::ptr_eq(&w, &self.driver));
        if on_self && thread.is_none_or(|t| t == current_tid()) {
            return;
        }
        rt_assert!(Fiber::current_is_stackful(), "switch_to called outside a fiber");
        tracing::trace!(scheduler = %self.name, ?thread, "switching fiber");
        self.schedule(Fiber::current(), thread);
        Fiber::yield_to_hold();
    }

    fn tickle(&self) {
        if let Some(driver) = self.driver.upgrade() {
            driver.tickle();
        }
    }

    /// Spawn the worker threads. A second call is a no-op.
    pub fn start(&self) -> RtResult<()> {
        let mut threads = self.threads.lock();
        if !self.stopping.load(Ordering::Acquire) {
            return Ok(());
        }
        let driver = self
            .driver
            .upgrade()
            .ok_or_else(|| RuntimeError::Detached(self.name.clone()))?;
        self.stopping.store(false, Ordering::Release);
        rt_assert!(threads.is_empty(), "scheduler {} restarted with live threads", self.name);
        self.thread_ids.lock().retain(|&t| Some(t) == self.root_tid);

        for i in 0..self.thread_count {
            let d = driver.clone();
            let thread = Thread::spawn(format!("{}_{}", self.name, i), move || Scheduler::run(&d))?;
            self.thread_ids.lock().push(thread.tid());
            threads.push(thread);
        }
        tracing::info!(
            scheduler = %self.name,
            threads = self.thread_count,
            use_caller = self.root_fiber.is_some(),
            "scheduler started"
        );
        Ok(())
    }

    /// Stop once all queued work is done, and join every worker.
    ///
    /// With use_caller this must be called on the constructing thread, which
    /// then runs the worker loop until the driver reports stopping.
    /// Without it, it must not be called from one of the workers.
    pub fn stop(&self) -> RtResult<()> {
        self.auto_stop.store(true, Ordering::Release);
        let driver = self
            .driver
            .upgrade()
            .ok_or_else(|| RuntimeError::Detached(self.name.clone()))?;

        if let Some(root) = &self.root_fiber {
            let state = root.state();
            if self.thread_count == 0 && matches!(state, FiberState::Term | FiberState::Init) {
                self.stopping.store(true, Ordering::Release);
                if driver.stopping() {
                    tracing::info!(scheduler = %self.name, "scheduler stopped");
                    return Ok(());
                }
            }
            rt_assert!(
                self.root_tid == Some(current_tid()),
                "use_caller scheduler {} stopped from a foreign thread",
                self.name
            );
        } else {
            let on_worker = tls::current_driver_weak().is_some_and(|w| Weak::ptr_eq(&w, &self.driver));
            rt_assert!(!on_worker, "scheduler {} stopped from its own worker", self.name);
        }

        self.stopping.store(true, Ordering::Release);
        for _ in 0..self.thread_count {
            driver.tickle();
        }
        if let Some(root) = &self.root_fiber {
            driver.tickle();
            if !root.state().is_terminated() && !driver.stopping() {
                root.call();
            }
            if std::ptr::eq(tls::scheduler_fiber(), Arc::as_ptr(root)) {
                tls::set_scheduler_fiber(std::ptr::null());
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        let mut result = Ok(());
        for mut thread in threads {
            if let Err(e) = thread.join() {
                tracing::error!(scheduler = %self.name, error = %e, "worker exited abnormally");
                result = result.and(Err(e));
            }
        }
        tracing::info!(scheduler = %self.name, "scheduler stopped");
        result
    }

    /// Stop requested, nothing queued and nothing running
    pub fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active.load(Ordering::Acquire) == 0
    }

    /// The worker loop. Returns once the idle fiber terminates.
    fn run(driver: &Arc<dyn Driver>) {
        let sched = driver.scheduler();
        let tid = current_tid();
        tracing::debug!(scheduler = %sched.name, tid, "worker running");

        tls::set_hook_enabled(true);
        tls::set_current_driver(Some(Arc::downgrade(driver)));
        driver.enter_thread();
        if sched.root_tid != Some(tid) {
            let main = Fiber::current();
            tls::set_scheduler_fiber(Arc::as_ptr(&main));
        }

        let idle_fiber = {
            let d = driver.clone();
            Fiber::new(move || d.idle(), 0, false)
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let mut busy = false;
            let picked = {
                let mut queue = sched.queue.lock();
                let mut picked = None;
                let mut i = 0;
                while i < queue.len() {
                    let unit = &queue[i];
                    if unit.thread.is_some_and(|t| t != tid) {
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    if let Task::Fiber(fiber) = &unit.task {
                        // Still switching out on another worker
                        if fiber.state() == FiberState::Exec {
                            busy = true;
                            i += 1;
                            continue;
                        }
                    }
                    picked = queue.remove(i);
                    sched.active.fetch_add(1, Ordering::AcqRel);
                    tickle_me |= i < queue.len();
                    break;
                }
                picked
            };

            if tickle_me {
                driver.tickle();
            }

            match picked.map(|unit| unit.task) {
                Some(Task::Fiber(fiber)) => {
                    if !fiber.state().is_terminated() {
                        fiber.swap_in();
                    }
                    sched.active.fetch_sub(1, Ordering::AcqRel);
                    if fiber.state() == FiberState::Ready {
                        sched.schedule(fiber, None);
                    }
                }
                Some(Task::Call(cb)) => {
                    let fiber = match cb_fiber.take() {
                        Some(fiber) => {
                            fiber.reset_callback(cb);
                            fiber
                        }
                        None => Fiber::with_callback(cb, 0, false),
                    };
                    fiber.swap_in();
                    sched.active.fetch_sub(1, Ordering::AcqRel);
                    match fiber.state() {
                        FiberState::Ready => sched.schedule(fiber, None),
                        FiberState::Term | FiberState::Except => cb_fiber = Some(fiber),
                        _ => {}
                    }
                }
                None => {
                    if busy {
                        std::thread::yield_now();
                        continue;
                    }
                    if idle_fiber.state().is_terminated() {
                        tracing::debug!(scheduler = %sched.name, tid, "idle fiber finished");
                        break;
                    }
                    sched.idle.fetch_add(1, Ordering::AcqRel);
                    idle_fiber.swap_in();
                    sched.idle.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        tls::set_hook_enabled(false);
        tracing::debug!(scheduler = %sched.name, tid, "worker exiting");
    }
}

impl Driver for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.threads.get_mut().is_empty() {
            tracing::warn!(scheduler = %self.name, "scheduler dropped without stop()");
        }
        tracing::debug!(scheduler = %self.name, "scheduler dropped");
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("use_caller", &self.root_fiber.is_some())
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

fn validate(threads: usize, name: &str) -> RtResult<()> {
    crate::config::RuntimeConfig::new()
        .threads(threads)
        .name(name)
        .validate()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gvfiber_core::error::ConfigError;
    use std::collections::HashSet;

    #[test]
    fn test_callbacks_run_on_workers() {
        let sched = Scheduler::new(2, false, "t-work").unwrap();
        sched.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let h = hits.clone();
            sched.schedule_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 100);
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn test_use_caller_runs_work_on_stop() {
        let sched = Scheduler::new(1, true, "t-caller").unwrap();
        sched.start().unwrap();
        let ran_on = Arc::new(Mutex::new(None));
        let r = ran_on.clone();
        sched.schedule_fn(move || {
            *r.lock() = Some(current_tid());
        });
        // Nothing runs until the caller joins the loop
        assert!(ran_on.lock().is_none());
        sched.stop().unwrap();
        assert_eq!(*ran_on.lock(), Some(current_tid()));
    }

    #[test]
    fn test_affinity_round_trip() {
        let sched = Scheduler::new(3, false, "t-pin").unwrap();
        sched.start().unwrap();
        let tids = sched.thread_ids();
        assert_eq!(tids.len(), 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for &tid in &tids {
            for _ in 0..10 {
                let s = seen.clone();
                sched.schedule(Task::call(move || s.lock().push((tid, current_tid()))), Some(tid));
            }
        }
        sched.stop().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 30);
        for &(wanted, actual) in seen.iter() {
            assert_eq!(wanted, actual);
        }
        let distinct: HashSet<_> = seen.iter().map(|&(_, t)| t).collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn test_switch_to_moves_fiber_between_workers() {
        let sched = Scheduler::new(2, false, "t-switch").unwrap();
        sched.start().unwrap();
        let tids = sched.thread_ids();
        let first = tids[0];

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        sched.schedule(
            Task::call(move || {
                let Some(driver) = Scheduler::current() else {
                    return;
                };
                let sched = driver.scheduler();
                let before = current_tid();
                let Some(&other) = tids.iter().find(|&&t| t != before) else {
                    return;
                };
                s.lock().push(before);
                // Already there
                sched.switch_to(Some(before));
                s.lock().push(current_tid());
                sched.switch_to(Some(other));
                s.lock().push(current_tid());
                sched.switch_to(None);
                s.lock().push(current_tid());
            }),
            Some(first),
        );
        sched.stop().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], first);
        assert_eq!(seen[1], first);
        assert_ne!(seen[2], first);
        assert_eq!(seen[3], seen[2]);
    }

    #[test]
    fn test_ready_fiber_is_requeued() {
        let sched = Scheduler::new(2, false, "t-ready").unwrap();
        sched.start().unwrap();
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(
            move || {
                for _ in 0..3 {
                    s.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_to_ready();
                }
                s.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );
        sched.schedule(fiber.clone(), None);
        sched.stop().unwrap();
        assert_eq!(steps.load(Ordering::SeqCst), 4);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_held_fiber_resumes_when_rescheduled() {
        let sched = Scheduler::new(2, false, "t-hold").unwrap();
        sched.start().unwrap();
        let parked: Arc<Mutex<Option<Arc<Fiber>>>> = Arc::new(Mutex::new(None));
        let done = Arc::new(AtomicBool::new(false));

        let (p, d) = (parked.clone(), done.clone());
        sched.schedule_fn(move || {
            *p.lock() = Some(Fiber::current());
            Fiber::yield_to_hold();
            d.store(true, Ordering::SeqCst);
        });

        let fiber = loop {
            if let Some(fiber) = parked.lock().take() {
                break fiber;
            }
            std::thread::yield_now();
        };
        assert!(!done.load(Ordering::SeqCst));
        // May still be EXEC while its worker switches out; the loop waits.
        sched.schedule(fiber, None);
        sched.stop().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_schedule_batch() {
        let sched = Scheduler::new(2, false, "t-batch").unwrap();
        sched.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task> = (0..20)
            .map(|_| {
                let h = hits.clone();
                Task::call(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        sched.schedule_batch(tasks);
        sched.stop().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_panicking_callback_does_not_kill_worker() {
        let sched = Scheduler::new(1, false, "t-panic").unwrap();
        sched.start().unwrap();
        let after = Arc::new(AtomicBool::new(false));
        sched.schedule_fn(|| panic!("callback failed"));
        let a = after.clone();
        sched.schedule_fn(move || a.store(true, Ordering::SeqCst));
        sched.stop().unwrap();
        assert!(after.load(Ordering::SeqCst));
    }

    #[test]
    fn test_current_inside_worker() {
        let sched = Scheduler::new(1, false, "t-current").unwrap();
        sched.start().unwrap();
        let name = Arc::new(Mutex::new(String::new()));
        let n = name.clone();
        sched.schedule_fn(move || {
            if let Some(driver) = Scheduler::current() {
                *n.lock() = driver.scheduler().name().to_string();
            }
        });
        sched.stop().unwrap();
        assert_eq!(*name.lock(), "t-current");
        assert!(std::thread::spawn(|| Scheduler::current().is_none()).join().unwrap());
    }

    #[test]
    fn test_invalid_construction() {
        assert!(matches!(
            Scheduler::new(0, false, "x"),
            Err(RuntimeError::Config(ConfigError::NoThreads))
        ));
        assert!(matches!(
            Scheduler::new(1, false, ""),
            Err(RuntimeError::Config(ConfigError::EmptyName))
        ));
    }

    #[test]
    fn test_stop_without_start() {
        let sched = Scheduler::new(2, false, "t-idle").unwrap();
        sched.stop().unwrap();
        assert!(sched.base_stopping());
    }
}
