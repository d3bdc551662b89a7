//! Thread-local runtime state
//!
//! Every OS thread that touches the runtime carries:
//!
//! - the fiber currently running on it,
//! - its main fiber (the thread's own stack, created on first use),
//! - the fiber that `swap_out` returns to (the scheduler loop's fiber),
//! - the scheduler and IoManager it works for,
//! - the hook enable flag.
//!
//! All of it is initialized lazily and lives until thread exit. Functions
//! that change any of it are named `set_*`.

use crate::fiber::Fiber;
use crate::iomanager::IoManager;
use crate::scheduler::Driver;
use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::{Arc, Weak};

thread_local! {
    /// Fiber running on this thread (borrowed from some live `Arc<Fiber>`)
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    /// The thread's own stack as a fiber, owned here
    static MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Where `swap_out` goes: the scheduler loop's fiber on this thread
    static SCHEDULER_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    static CURRENT_DRIVER: RefCell<Option<Weak<dyn Driver>>> = const { RefCell::new(None) };

    static CURRENT_IOMANAGER: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };

    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

#[inline]
pub(crate) fn current_fiber() -> *const Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline]
pub(crate) fn set_current_fiber(fiber: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(fiber));
}

/// Forget `fiber` if it is the current one (used while it is being dropped).
pub(crate) fn clear_current_fiber_if(fiber: *const Fiber) {
    let _ = CURRENT_FIBER.try_with(|c| {
        if ptr::eq(c.get(), fiber) {
            c.set(ptr::null());
        }
    });
}

/// The thread's main fiber, created on first use.
pub(crate) fn main_fiber(create: impl FnOnce() -> Arc<Fiber>) -> *const Fiber {
    MAIN_FIBER.with(|slot| {
        let mut slot = slot.borrow_mut();
        Arc::as_ptr(slot.get_or_insert_with(create))
    })
}

#[inline]
pub(crate) fn scheduler_fiber() -> *const Fiber {
    SCHEDULER_FIBER.with(|c| c.get())
}

#[inline]
pub(crate) fn set_scheduler_fiber(fiber: *const Fiber) {
    SCHEDULER_FIBER.with(|c| c.set(fiber));
}

/// Scheduler this thread works for, if it is still alive
pub(crate) fn current_driver() -> Option<Arc<dyn Driver>> {
    CURRENT_DRIVER.with(|d| d.borrow().as_ref().and_then(Weak::upgrade))
}

pub(crate) fn current_driver_weak() -> Option<Weak<dyn Driver>> {
    CURRENT_DRIVER.with(|d| d.borrow().clone())
}

pub(crate) fn set_current_driver(driver: Option<Weak<dyn Driver>>) {
    CURRENT_DRIVER.with(|d| *d.borrow_mut() = driver);
}

pub(crate) fn current_io_manager() -> Option<Arc<IoManager>> {
    CURRENT_IOMANAGER.with(|d| d.borrow().as_ref().and_then(Weak::upgrade))
}

pub(crate) fn set_current_io_manager(iom: Option<Weak<IoManager>>) {
    CURRENT_IOMANAGER.with(|d| *d.borrow_mut() = iom);
}

/// Whether blocking calls on this thread go through the reactor
#[inline]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Opt this thread in or out of hooking
#[inline]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}
