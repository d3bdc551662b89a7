//! # gvfiber-core
//!
//! Core types shared by the gvfiber crates.
//!
//! This crate is platform-agnostic and contains no context-switching or
//! epoll code. Everything that touches the OS lives in `gvfiber-runtime`
//! and `gvfiber-hook`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber state machine
//! - `error` - Error types for operational failures
//! - `fatal` - Fatal assertions for invariant violations
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod fatal;
pub mod env;

// Re-exports for convenience
pub use id::FiberId;
pub use state::FiberState;
pub use error::{ConfigError, RtResult, RuntimeError};
pub use env::{env_get, env_get_bool, env_get_size, env_get_str};

/// Runtime-wide constants
pub mod constants {
    /// Default fiber stack size (128 KiB)
    pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

    /// Smallest stack a fiber may be created with
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Default TCP connect timeout in milliseconds
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Upper bound on a single reactor wait, in milliseconds
    pub const MAX_WAIT_MS: u64 = 3000;

    /// Events fetched per epoll_wait call
    pub const MAX_EVENTS: usize = 256;

    /// Initial size of the per-fd context tables
    pub const INITIAL_FD_CONTEXTS: usize = 32;

    /// Clock steps further back than this expire every timer
    pub const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;
}
