//! # gvfiber-hook
//!
//! Blocking-looking I/O for fibers.
//!
//! Code running inside an `IoManager` fiber calls the functions in
//! [`syscall`] (or the [`net`] types built on them) exactly as it would call
//! libc. When the call would block, the fiber is parked on the reactor and
//! the worker thread runs something else. Hooking is switched on per thread
//! by the scheduler's run loop and can be toggled with [`set_hook_enabled`].
//!
//! ## Modules
//!
//! - [`fd_manager`]: per-descriptor state (socket?, nonblocking views, timeouts)
//! - [`syscall`]: the hooked calls
//! - [`net`]: `FiberTcpListener` / `FiberTcpStream`

pub mod fd_manager;
pub mod net;
pub mod syscall;

pub use fd_manager::{FdCtx, FdManager, TimeoutKind};
pub use gvfiber_runtime::{is_hook_enabled, set_hook_enabled};
pub use net::{FiberTcpListener, FiberTcpStream};
