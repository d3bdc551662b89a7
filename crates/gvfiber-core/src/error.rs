//! Error types for the gvfiber runtime
//!
//! Only operational failures are errors. Broken invariants (illegal fiber
//! state transitions, double-armed events, failed stack allocation) are
//! fatal and go through [`crate::fatal`] instead.

use std::io;
use std::os::fd::RawFd;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RuntimeError>;

/// Errors returned by the scheduler, reactor and thread layers
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Spawning an OS worker thread failed
    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A worker thread panicked before it could be joined
    #[error("thread {0} panicked")]
    ThreadPanicked(String),

    /// An OS call failed
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// epoll rejected an event registration
    #[error("epoll registration for fd {fd} failed: {source}")]
    Register {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// The scheduler's owner has already been dropped
    #[error("scheduler {0} is detached from its driver")]
    Detached(String),

    /// The calling thread is not a worker of any scheduler
    #[error("no scheduler on this thread")]
    NoScheduler,

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl RuntimeError {
    /// Capture `errno` for a failed OS call
    pub fn last_os(op: &'static str) -> Self {
        RuntimeError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Raw errno carried by this error, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            RuntimeError::Spawn { source, .. }
            | RuntimeError::Os { source, .. }
            | RuntimeError::Register { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("thread count must be at least 1")]
    NoThreads,

    #[error("stack size {size} is below the minimum of {min} bytes")]
    StackTooSmall { size: usize, min: usize },

    #[error("scheduler name must not be empty")]
    EmptyName,
}
