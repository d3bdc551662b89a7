//! gvfiber configuration
//!
//! Two layers:
//!
//! - `RuntimeConfig`: how an `IoManager` is built (threads, use_caller,
//!   name). Library defaults with environment overrides, plus a builder.
//! - `ConfigVar` tunables (`fiber.stack_size`, `tcp.connect.timeout`) that
//!   can change while the runtime is up.
//!
//! # Example
//!
//! ```rust,ignore
//! use gvfiber_runtime::config::{RuntimeConfig, fiber_stack_size};
//!
//! let config = RuntimeConfig::from_env().threads(4).name("io");
//! fiber_stack_size().set(256 * 1024);
//! ```
//!
//! # Environment
//!
//! | variable | default |
//! |---|---|
//! | `GVF_THREADS` | available parallelism |
//! | `GVF_USE_CALLER` | false |
//! | `GVF_NAME` | `gvfiber` |
//! | `GVF_FIBER_STACK_SIZE` | 128k |
//! | `GVF_TCP_CONNECT_TIMEOUT_MS` | 5000 |

pub mod defaults;
mod var;

pub use var::{fiber_stack_size, tcp_connect_timeout, ConfigVar};

use gvfiber_core::env::{env_get, env_get_bool, env_get_str};
use gvfiber_core::error::ConfigError;

/// Scheduler / IoManager construction parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Worker threads, the caller included when `use_caller` is set
    pub threads: usize,
    /// Let the constructing thread act as a worker
    pub use_caller: bool,
    /// Scheduler name; worker threads are named `{name}_{i}`
    pub name: String,
}

impl RuntimeConfig {
    /// Library defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self {
            threads: env_get("GVF_THREADS", defaults::threads()),
            use_caller: env_get_bool("GVF_USE_CALLER", defaults::USE_CALLER),
            name: env_get_str("GVF_NAME", defaults::NAME),
        }
    }

    /// Library defaults, environment ignored
    pub fn new() -> Self {
        Self {
            threads: defaults::threads(),
            use_caller: defaults::USE_CALLER,
            name: defaults::NAME.to_string(),
        }
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn use_caller(mut self, enable: bool) -> Self {
        self.use_caller = enable;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env() {
        let config = RuntimeConfig::from_env();
        assert!(config.threads >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new().threads(8).use_caller(true).name("io");
        assert_eq!(config.threads, 8);
        assert!(config.use_caller);
        assert_eq!(config.name, "io");
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            RuntimeConfig::new().threads(0).validate(),
            Err(ConfigError::NoThreads)
        );
        assert_eq!(
            RuntimeConfig::new().name("").validate(),
            Err(ConfigError::EmptyName)
        );
    }
}
