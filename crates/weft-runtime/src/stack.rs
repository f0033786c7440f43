//! Fiber stacks
//!
//! Each fiber owns an mmap'd region with a PROT_NONE guard page at
//! the low end, so overflow faults instead of corrupting a neighbor.
//! Allocation failure is fatal: there is no way to hand a usable
//! fiber back to the caller without a stack.

use weft_core::werror;

use crate::last_errno;

/// An owned, guard-paged stack mapping
pub struct Stack {
    base: *mut u8,
    size: usize,
}

// Safety: the mapping is owned; the raw pointer never aliases
// another Stack.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack of at least `size` usable bytes (rounded up to
    /// whole pages, minimum two pages) plus one guard page.
    ///
    /// Aborts the process if the kernel refuses the mapping.
    pub fn alloc(size: usize) -> Stack {
        let page = page_size();
        let usable = (size.max(page * 2) + page - 1) & !(page - 1);
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            werror!("fiber stack mmap failed: size={} errno={}", total, last_errno());
            std::process::abort();
        }

        // Guard page at the low end
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            werror!("fiber stack guard mprotect failed: errno={}", last_errno());
            std::process::abort();
        }

        Stack {
            base: base as *mut u8,
            size: total,
        }
    }

    /// High end of the mapping; the initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        // Safety: base + size stays within the mapping bounds
        unsafe { self.base.add(self.size) }
    }

    /// Low end of the mapping (the guard page)
    #[inline]
    pub fn base(&self) -> *const u8 {
        self.base
    }

    /// Total mapped bytes, guard page included
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

pub(crate) fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}
