//! # gvfiber-runtime
//!
//! Fiber runtime for Linux.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Guarded mmap fiber stacks
//! - Stackful fibers and the per-thread fiber bookkeeping
//! - The N:M scheduler and its worker threads
//! - Deadline-ordered timers
//! - The epoll reactor (`IoManager`)
//! - Hot-reloadable tunables

pub mod arch;
pub mod config;
pub mod fiber;
pub mod iomanager;
pub mod memory;
pub mod scheduler;
pub mod thread;
pub mod timer;
pub mod tls;

// Re-exports
pub use config::{fiber_stack_size, tcp_connect_timeout, ConfigVar, RuntimeConfig};
pub use fiber::{Callback, Fiber};
pub use iomanager::{Event, IoManager};
pub use scheduler::{Driver, Scheduler, Task};
pub use thread::{current_tid, Thread, Tid};
pub use timer::{Clock, ManualClock, MonotonicClock, Timer, TimerCallback, TimerManager};
pub use tls::{is_hook_enabled, set_hook_enabled};

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("gvfiber-runtime requires Linux (epoll)");
    }
}

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
