//! Fatal assertions
//!
//! The runtime treats internal misuse (resuming a running fiber, arming the
//! same event twice, failing to map a stack) as a defect, not an error.
//! These helpers log the violation with a backtrace and abort the process.

use std::backtrace::Backtrace;
use std::fmt;

/// Log `msg` with a captured backtrace, then abort.
#[cold]
#[inline(never)]
pub fn abort_with(msg: fmt::Arguments<'_>) -> ! {
    let backtrace = Backtrace::force_capture();
    tracing::error!(target: "gvfiber::fatal", "{msg}\nbacktrace:\n{backtrace}");
    // The subscriber may be buffered or absent.
    eprintln!("gvfiber: fatal: {msg}");
    std::process::abort()
}

/// Abort with a formatted message.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {
        $crate::fatal::abort_with(format_args!($($arg)+))
    };
}

/// Assert an invariant; on failure log with a backtrace and abort.
///
/// Unlike `assert!` this is never compiled out and never unwinds, so a
/// violation cannot be swallowed by a `catch_unwind` inside a fiber.
#[macro_export]
macro_rules! rt_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::fatal::abort_with(format_args!(
                "assertion failed: {}",
                stringify!($cond)
            ))
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal::abort_with(format_args!(
                "assertion failed: {}: {}",
                stringify!($cond),
                format_args!($($arg)+)
            ))
        }
    };
}
