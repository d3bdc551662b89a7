//! Architecture-specific context switching
//!
//! Each backend exposes the same three items:
//!
//! - `Registers` - the callee-saved register snapshot of a suspended context
//! - `init_context` - prepare a fresh stack so the first switch enters `entry(arg)`
//! - `context_switch` - save the current context into `old`, resume `new`

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
    }
}

/// Entry point of a freshly initialized context. Must never return.
pub type EntryFn = extern "C" fn(usize) -> !;
