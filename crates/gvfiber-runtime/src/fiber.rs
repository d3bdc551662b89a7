//! Stackful fibers
//!
//! A `Fiber` owns an mmap'd stack, a saved register context and a
//! callback. It is always handled through `Arc<Fiber>`: the scheduler queue,
//! a timer or an armed fd event can each hold a handle to a suspended fiber,
//! and the stack is released when the last handle goes away.
//!
//! Two pairs of switch operations exist:
//!
//! - `swap_in` / `swap_out`: between the thread's scheduler fiber and this
//!   fiber (ordinary worker fibers);
//! - `call` / `back`: between the thread's main fiber and this fiber
//!   (the use_caller root fiber, or fibers driven by hand).
//!
//! All raw context manipulation in the crate happens here and in `arch`.

use crate::config::fiber_stack_size;
use crate::current_arch::{context_switch, init_context, Registers};
use crate::arch::EntryFn;
use crate::memory::Stack;
use crate::tls;
use gvfiber_core::constants::MIN_STACK_SIZE;
use gvfiber_core::error::ConfigError;
use gvfiber_core::{fatal, rt_assert, FiberId, FiberState};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

/// Work run by a fiber
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Fibers currently alive, main fibers included
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

/// Cached `fiber.stack_size`, kept current by a config listener
static STACK_SIZE: AtomicUsize = AtomicUsize::new(0);
static STACK_SIZE_INIT: Once = Once::new();

fn default_stack_size() -> usize {
    STACK_SIZE_INIT.call_once(|| {
        let var = fiber_stack_size();
        var.add_listener(|_, new| STACK_SIZE.store(*new, Ordering::Relaxed));
        STACK_SIZE.store(var.get(), Ordering::Relaxed);
    });
    STACK_SIZE.load(Ordering::Relaxed)
}

fn checked_stack_size(size: usize) -> usize {
    if size < MIN_STACK_SIZE {
        let err = ConfigError::StackTooSmall { size, min: MIN_STACK_SIZE };
        tracing::warn!("{err}, using the minimum");
        return MIN_STACK_SIZE;
    }
    size
}

/// A stackful coroutine
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// Finishes through `back` instead of `swap_out`
    use_caller: bool,
    regs: UnsafeCell<Registers>,
    /// `None` only for a thread's main fiber
    stack: Option<Stack>,
    callback: UnsafeCell<Option<Callback>>,
}

// Safety: `regs` and `callback` are only touched by the thread that is
// switching into or out of the fiber; the state machine (EXEC is exclusive)
// keeps two threads from doing so at once.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber that will run `f` on a fresh stack.
    ///
    /// `stack_size == 0` uses `fiber.stack_size`. Failing to map the stack
    /// aborts the process.
    pub fn new<F>(f: F, stack_size: usize, use_caller: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_callback(Box::new(f), stack_size, use_caller)
    }

    pub fn with_callback(callback: Callback, stack_size: usize, use_caller: bool) -> Arc<Fiber> {
        let size = checked_stack_size(if stack_size == 0 { default_stack_size() } else { stack_size });
        let stack = match Stack::allocate(size) {
            Ok(stack) => stack,
            Err(e) => fatal!("fiber stack allocation of {size} bytes failed: {e}"),
        };

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Init as u8),
            use_caller,
            regs: UnsafeCell::new(Registers::default()),
            stack: Some(stack),
            callback: UnsafeCell::new(Some(callback)),
        });
        fiber.prepare_context();
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(fiber = %fiber.id, size, "fiber created");
        fiber
    }

    /// The thread's own stack, wrapped as a fiber that is always running.
    fn new_main() -> Arc<Fiber> {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Exec as u8),
            use_caller: false,
            regs: UnsafeCell::new(Registers::default()),
            stack: None,
            callback: UnsafeCell::new(None),
        })
    }

    fn prepare_context(&self) {
        let Some(stack) = self.stack.as_ref() else {
            fatal!("fiber {} has no stack to prepare", self.id)
        };
        let entry: EntryFn = if self.use_caller { fiber_caller_main } else { fiber_main };
        // Safety: the stack is ours and the fiber is not running (INIT or
        // finished), so nothing else reads `regs` concurrently.
        unsafe {
            init_context(self.regs.get(), stack.top(), entry, self as *const Fiber as usize);
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// False only for a thread's main fiber
    #[inline]
    pub fn is_stackful(&self) -> bool {
        self.stack.is_some()
    }

    /// Usable stack bytes (0 for a main fiber)
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    /// Re-arm a finished (or never started) fiber with a new callback,
    /// reusing its stack.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_callback(Box::new(f));
    }

    pub fn reset_callback(&self, callback: Callback) {
        rt_assert!(self.stack.is_some(), "reset of main fiber {}", self.id);
        let state = self.state();
        rt_assert!(state.is_resettable(), "reset of fiber {} in state {}", self.id, state);

        // Safety: not running (see assertion), so no one else touches it.
        unsafe {
            *self.callback.get() = Some(callback);
        }
        self.prepare_context();
        self.set_state(FiberState::Init);
    }

    /// Switch from this thread's scheduler fiber into this fiber.
    pub fn swap_in(&self) {
        self.resume_from(scheduler_or_main_fiber());
    }

    /// Switch from this fiber back to this thread's scheduler fiber.
    pub fn swap_out(&self) {
        self.suspend_to(scheduler_or_main_fiber());
    }

    /// Switch from this thread's main fiber into this fiber.
    pub fn call(&self) {
        self.resume_from(thread_main_fiber());
    }

    /// Switch from this fiber back to this thread's main fiber.
    pub fn back(&self) {
        self.suspend_to(thread_main_fiber());
    }

    fn resume_from(&self, from: *const Fiber) {
        rt_assert!(!ptr::eq(from, self), "fiber {} switching to itself", self.id);
        let state = self.state();
        rt_assert!(
            state != FiberState::Exec && !state.is_terminated(),
            "fiber {} resumed in state {}",
            self.id,
            state
        );

        tls::set_current_fiber(self);
        self.set_state(FiberState::Exec);
        // Safety: `from` is the live fiber this thread is running on (its
        // scheduler or main fiber); `self` holds a prepared or saved context.
        unsafe {
            context_switch((*from).regs.get(), self.regs.get());
        }
        // Back on `from`: the fiber's registers are fully saved now, so a
        // hold may be published to other threads.
        let _ = self.state.compare_exchange(
            FiberState::Exec as u8,
            FiberState::Hold as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn suspend_to(&self, to: *const Fiber) {
        tls::set_current_fiber(to);
        // Safety: `to` is suspended in `resume_from` on this very thread.
        unsafe {
            context_switch(self.regs.get(), (*to).regs.get());
        }
    }

    /// The fiber running on this thread, creating the main fiber if needed.
    pub fn current() -> Arc<Fiber> {
        let mut ptr = tls::current_fiber();
        if ptr.is_null() {
            ptr = thread_main_fiber();
            tls::set_current_fiber(ptr);
        }
        // Safety: the current fiber is kept alive by whoever resumed it (or
        // by the thread-local main fiber slot).
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Id of the running fiber without materializing a main fiber
    pub fn current_id() -> Option<FiberId> {
        let ptr = tls::current_fiber();
        // Safety: see `current`.
        (!ptr.is_null()).then(|| unsafe { (*ptr).id })
    }

    /// True when running on a stackful fiber (not a thread's main fiber)
    pub fn current_is_stackful() -> bool {
        let ptr = tls::current_fiber();
        // Safety: see `current`.
        !ptr.is_null() && unsafe { (*ptr).is_stackful() }
    }

    /// Give up the thread and ask to be scheduled again.
    pub fn yield_to_ready() {
        let raw = Self::current_stackful("yield_to_ready");
        // Safety: the resumer holds a strong reference while we run.
        unsafe {
            (*raw).set_state(FiberState::Ready);
            (*raw).swap_out();
        }
    }

    /// Give up the thread until someone schedules this fiber explicitly.
    ///
    /// The state stays EXEC until the switch has completed; the resuming
    /// side then turns it into HOLD, so another worker can never pick the
    /// fiber up while its registers are still live.
    pub fn yield_to_hold() {
        let raw = Self::current_stackful("yield_to_hold");
        // Safety: as above.
        unsafe {
            (*raw).swap_out();
        }
    }

    /// Raw pointer to the running fiber, with no strong count held across
    /// the coming switch.
    fn current_stackful(op: &str) -> *const Fiber {
        let cur = Fiber::current();
        rt_assert!(cur.is_stackful(), "{op} from a thread's main fiber");
        let state = cur.state();
        rt_assert!(state == FiberState::Exec, "{op} from fiber {} in state {}", cur.id, state);
        Arc::as_ptr(&cur)
    }

    /// Number of fibers alive in the process
    pub fn total() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    /// Run the stored callback inside a panic boundary and record how it ended.
    fn run_callback(&self) {
        // Safety: only the running fiber reads its own callback.
        let callback = unsafe { (*self.callback.get()).take() };
        let Some(callback) = callback else {
            fatal!("fiber {} started without a callback", self.id)
        };

        match panic::catch_unwind(AssertUnwindSafe(callback)) {
            Ok(()) => self.set_state(FiberState::Term),
            Err(payload) => {
                self.set_state(FiberState::Except);
                let backtrace = Backtrace::force_capture();
                tracing::error!(
                    fiber = %self.id,
                    panic = panic_message(payload.as_ref()),
                    "fiber callback panicked\n{backtrace}"
                );
            }
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        let state = self.state();
        if self.stack.is_some() {
            rt_assert!(state.is_resettable(), "fiber {} dropped in state {}", self.id, state);
        } else {
            rt_assert!(self.callback.get_mut().is_none());
            rt_assert!(state == FiberState::Exec, "main fiber {} in state {}", self.id, state);
            tls::clear_current_fiber_if(self);
        }
        tracing::trace!(fiber = %self.id, "fiber dropped");
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

fn thread_main_fiber() -> *const Fiber {
    tls::main_fiber(Fiber::new_main)
}

fn scheduler_or_main_fiber() -> *const Fiber {
    let sched = tls::scheduler_fiber();
    if sched.is_null() {
        thread_main_fiber()
    } else {
        sched
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Entry of worker fibers; ends on the scheduler fiber.
extern "C" fn fiber_main(arg: usize) -> ! {
    // Safety: `arg` is the fiber's own address (see `prepare_context`) and
    // the resumer keeps it alive while it runs.
    let fiber = unsafe { &*(arg as *const Fiber) };
    fiber.run_callback();
    fiber.swap_out();
    fatal!("fiber {} resumed after termination", fiber.id)
}

/// Entry of use_caller fibers; ends on the thread's main fiber.
extern "C" fn fiber_caller_main(arg: usize) -> ! {
    // Safety: as in `fiber_main`.
    let fiber = unsafe { &*(arg as *const Fiber) };
    fiber.run_callback();
    fiber.back();
    fatal!("fiber {} resumed after termination", fiber.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_call_runs_to_completion() {
        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();
        let fiber = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, 0, true);
        assert_eq!(fiber.state(), FiberState::Init);

        fiber.call();
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_yield_and_resume() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let fiber = Fiber::new(move || {
            l.lock().push("start");
            Fiber::yield_to_hold();
            l.lock().push("middle");
            Fiber::yield_to_ready();
            l.lock().push("end");
        }, 64 * 1024, false);

        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Hold);
        log.lock().push("main-1");

        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Ready);
        log.lock().push("main-2");

        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*log.lock(), vec!["start", "main-1", "middle", "main-2", "end"]);
    }

    #[test]
    fn test_panic_sets_except() {
        let fiber = Fiber::new(|| panic!("boom"), 0, false);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Except);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let fiber = Fiber::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }, 0, false);
        let size = fiber.stack_size();
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);

        let c = count.clone();
        fiber.reset(move || {
            c.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Init);
        assert_eq!(fiber.stack_size(), size);
        fiber.swap_in();
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_current_inside_fiber() {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let fiber = Fiber::new(move || {
            *s.lock() = Some(Fiber::current().id());
        }, 0, false);
        let id = fiber.id();
        fiber.swap_in();
        assert_eq!(*seen.lock(), Some(id));

        // Back on the main fiber
        let main = Fiber::current();
        assert!(!main.is_stackful());
        assert_eq!(main.state(), FiberState::Exec);
        assert_eq!(Fiber::current_id(), Some(main.id()));
    }

    #[test]
    fn test_stack_released_with_last_handle() {
        std::thread::spawn(|| {
            let fiber = Fiber::new(|| {}, 0, false);
            let extra = fiber.clone();
            assert!(Fiber::total() >= 1);
            fiber.swap_in();
            drop(fiber);
            assert_eq!(extra.state(), FiberState::Term);
            drop(extra);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_tiny_stack_is_raised_to_minimum() {
        let fiber = Fiber::new(|| {}, 1024, false);
        assert!(fiber.stack_size() >= MIN_STACK_SIZE);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_explicit_stack_size() {
        let fiber = Fiber::new(|| {}, 256 * 1024, false);
        assert!(fiber.stack_size() >= 256 * 1024);
        fiber.swap_in();
    }

    #[test]
    fn test_default_stack_size_follows_config() {
        let var = fiber_stack_size();
        let before = var.get();
        // Prime the cached default before changing it.
        Fiber::new(|| {}, 0, false).swap_in();

        var.set(256 * 1024);
        let fiber = Fiber::new(|| {}, 0, false);
        assert_eq!(fiber.stack_size(), 256 * 1024);
        fiber.swap_in();

        // Below the floor
        var.set(4096);
        let fiber = Fiber::new(|| {}, 0, false);
        let floor = Fiber::new(|| {}, MIN_STACK_SIZE, false);
        assert_eq!(fiber.stack_size(), floor.stack_size());
        fiber.swap_in();
        floor.swap_in();

        var.set(before);
        let fiber = Fiber::new(|| {}, 0, false);
        assert_eq!(fiber.stack_size(), Fiber::new(|| {}, before, false).stack_size());
    }
}
