//! Unix stack implementation using mmap

use super::{page_size, Stack};
use std::io;

impl Stack {
    /// Map a stack with at least `size` usable bytes plus one guard page.
    pub fn allocate(size: usize) -> io::Result<Stack> {
        if size == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let page = page_size();
        let usable = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        let mapped = usable
            .checked_add(page)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Guard page at the low end stays inaccessible; overflow => SIGSEGV
        let ret = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::munmap(base, mapped);
            }
            return Err(err);
        }

        Ok(Stack {
            base: base as *mut u8,
            mapped,
            usable,
        })
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.mapped) };
        if ret != 0 {
            tracing::warn!(
                base = ?self.base,
                len = self.mapped,
                error = %io::Error::last_os_error(),
                "munmap of fiber stack failed"
            );
        }
    }
}
