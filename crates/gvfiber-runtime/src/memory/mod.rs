//! Fiber stack memory
//!
//! Every stackful fiber owns one `Stack`: an anonymous private mapping with a
//! `PROT_NONE` guard page at its low end, so an overflow faults instead of
//! silently corrupting the neighbouring allocation.
//!
//! ```text
//! base                                                   base + mapped
//! ┌───────────┬──────────────────────────────────────────┐
//! │ guard     │ usable stack (grows downward)        ◀── │ top()
//! └───────────┴──────────────────────────────────────────┘
//! ```

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
    } else {
        compile_error!("Unsupported platform");
    }
}

/// An owned, guarded fiber stack. Unmapped on drop.
#[derive(Debug)]
pub struct Stack {
    /// Start of the whole mapping (guard page included)
    base: *mut u8,
    /// Bytes mapped, guard included
    mapped: usize,
    /// Usable bytes above the guard page
    usable: usize,
}

// Safety: the mapping is exclusively owned and only touched by whichever
// thread is currently running the fiber.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Highest address of the usable region (initial stack pointer)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        // Safety: base + mapped is one past the end of our own mapping.
        unsafe { self.base.add(self.mapped) }
    }

    /// Usable bytes, guard page excluded
    #[inline]
    pub fn size(&self) -> usize {
        self.usable
    }
}

/// System page size, cached after the first query
pub fn page_size() -> usize {
    use std::sync::OnceLock;
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // Safety: sysconf has no preconditions.
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n > 0 { n as usize } else { 4096 }
    })
}
