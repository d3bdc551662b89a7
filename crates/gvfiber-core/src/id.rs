//! Fiber identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of fresh fiber ids. Zero is reserved for "no fiber".
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a fiber
///
/// Ids are handed out from a process-wide monotonic counter and never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Sentinel value meaning "no fiber"
    pub const NONE: FiberId = FiberId(0);

    /// Allocate the next id
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a FiberId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(b > a);
        assert!(!a.is_none());
    }

    #[test]
    fn test_none_display() {
        assert!(FiberId::NONE.is_none());
        assert_eq!(FiberId::NONE.to_string(), "none");
        assert_eq!(FiberId::new(7).to_string(), "7");
        assert_eq!(format!("{:?}", FiberId::new(7)), "FiberId(7)");
    }
}
