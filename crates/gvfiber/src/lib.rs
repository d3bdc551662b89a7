//! # gvfiber - stackful fibers for Linux
//!
//! Fibers are scheduled N:M onto a pool of worker threads. Each worker
//! waits in epoll when it has nothing to run, so a fiber that blocks on a
//! socket or a sleep (through [`syscall`] or the [`net`] types) parks itself
//! and the thread moves on.
//!
//! ## Quick Start
//!
//! ```ignore
//! use gvfiber::{Runtime, RuntimeConfig, spawn, sleep};
//! use std::time::Duration;
//!
//! fn main() -> gvfiber::RtResult<()> {
//!     gvfiber::init_logging();
//!     let rt = Runtime::new(RuntimeConfig::from_env().threads(2))?;
//!
//!     rt.spawn(|| {
//!         spawn(|| println!("nested fiber")).ok();
//!         sleep(Duration::from_millis(100));
//!         println!("woke up");
//!     });
//!
//!     // Waits for every fiber, timer and armed event.
//!     rt.shutdown()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │   User code: spawn(), sleep(), FiberTcpStream, syscall::*    │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  IoManager: Scheduler run queue + epoll + TimerManager       │
//! └──────────────────────────────────────────────────────────────┘
//!          │                    │                    │
//!          ▼                    ▼                    ▼
//!    ┌───────────┐        ┌───────────┐        ┌───────────┐
//!    │  Worker   │        │  Worker   │        │  Worker   │
//!    │  fibers   │        │  fibers   │        │  fibers   │
//!    └───────────┘        └───────────┘        └───────────┘
//!          │                    │                    │
//!          └────────────────────┼────────────────────┘
//!                               ▼
//!    ┌──────────────────────────────────────────────────────────┐
//!    │      mmap'd fiber stacks with guard pages                │
//!    └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Environment
//!
//! - `GVF_LOG` - log filter for [`init_logging`] (default `info`)
//! - `GVF_THREADS`, `GVF_USE_CALLER`, `GVF_NAME` - see [`RuntimeConfig::from_env`]

use std::sync::Arc;
use std::time::Duration;

// Re-export core types
pub use gvfiber_core::{ConfigError, FiberId, FiberState, RtResult, RuntimeError};

// Re-export runtime types
pub use gvfiber_runtime::{
    current_tid, fiber_stack_size, tcp_connect_timeout, ConfigVar, Driver, Event, Fiber, IoManager, RuntimeConfig,
    Scheduler, Task, Thread, Tid, Timer, TimerManager,
};

// Re-export the hook layer
pub use gvfiber_hook::{
    is_hook_enabled, net, set_hook_enabled, syscall, FdCtx, FdManager, FiberTcpListener, FiberTcpStream, TimeoutKind,
};

/// Install a `tracing` fmt subscriber filtered by `GVF_LOG`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("GVF_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("logging initialized");
    }
}

/// Owning handle to an [`IoManager`]
///
/// Workers start on construction. Dropping the handle stops the runtime,
/// which waits for every queued fiber, pending timer and armed event.
pub struct Runtime {
    iom: Arc<IoManager>,
    stopped: bool,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> RtResult<Runtime> {
        let iom = IoManager::from_config(&config)?;
        tracing::info!(name = %config.name, threads = config.threads, use_caller = config.use_caller, "runtime started");
        Ok(Runtime { iom, stopped: false })
    }

    /// Runtime built from `GVF_*` environment variables
    pub fn from_env() -> RtResult<Runtime> {
        Self::new(RuntimeConfig::from_env())
    }

    pub fn io_manager(&self) -> &Arc<IoManager> {
        &self.iom
    }

    /// Run `f` in a new fiber on this runtime.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.iom.schedule_fn(f);
    }

    /// Stop and join the workers; returns the first worker failure.
    pub fn shutdown(mut self) -> RtResult<()> {
        self.stop()
    }

    fn stop(&mut self) -> RtResult<()> {
        if std::mem::replace(&mut self.stopped, true) {
            return Ok(());
        }
        self.iom.stop()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!(error = %e, "runtime shutdown failed");
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("pending_events", &self.iom.pending_event_count())
            .field("stopped", &self.stopped)
            .finish()
    }
}

/// Run `f` in a new fiber on the scheduler of the calling worker.
pub fn spawn<F>(f: F) -> RtResult<()>
where
    F: FnOnce() + Send + 'static,
{
    let driver = Scheduler::current().ok_or(RuntimeError::NoScheduler)?;
    driver.scheduler().schedule_fn(f);
    Ok(())
}

/// Let other fibers run. Outside a fiber this yields the OS thread.
pub fn yield_now() {
    if Fiber::current_is_stackful() && Scheduler::current().is_some() {
        Fiber::yield_to_ready();
    } else {
        std::thread::yield_now();
    }
}

/// Sleep without holding the worker when called from a reactor fiber.
pub fn sleep(duration: Duration) {
    let req = libc::timespec {
        tv_sec: duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    };
    // Safety: `req` is valid and no remainder is requested.
    let rc = unsafe { syscall::nanosleep(&req, std::ptr::null_mut()) };
    if rc == -1 {
        tracing::debug!(error = %std::io::Error::last_os_error(), "nanosleep interrupted");
    }
}
