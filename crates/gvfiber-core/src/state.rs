//! Fiber state machine

use core::fmt;

/// State of a fiber
///
/// ```text
/// INIT ──swap_in/call──▶ EXEC ──yield──▶ HOLD | READY
///                          │
///                          └──callback returns──▶ TERM
///                          └──callback panics───▶ EXCEPT
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created (or reset), not yet run
    Init = 0,

    /// Suspended; resumed only when someone schedules it explicitly
    Hold = 1,

    /// Currently running on some thread
    Exec = 2,

    /// Callback returned normally
    Term = 3,

    /// Suspended and eligible for re-scheduling
    Ready = 4,

    /// Callback panicked
    Except = 5,
}

impl FiberState {
    /// Callback has finished, one way or another
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// States in which the stack may be reused or released
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            FiberState::Init => "INIT",
            FiberState::Hold => "HOLD",
            FiberState::Exec => "EXEC",
            FiberState::Term => "TERM",
            FiberState::Ready => "READY",
            FiberState::Except => "EXCEPT",
        }
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            5 => FiberState::Except,
            _ => FiberState::Init, // Default for invalid values
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
