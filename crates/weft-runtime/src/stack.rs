//! Fiber stacks
//!
//! Each stack is a private anonymous mapping with a PROT_NONE guard page at
//! the low end, so overflow faults instead of corrupting a neighbor. The
//! mapping is released when the `Stack` is dropped; the owning fiber must
//! not be RUNNING at that point.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use weft_core::error::{RuntimeError, RuntimeResult};

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let sz = if sz == 0 { 4096 } else { sz };
    PAGE_SIZE.store(sz, Ordering::Relaxed);
    sz
}

/// A guard-paged fiber stack.
pub struct Stack {
    base: *mut u8,
    total: usize,
    usable: usize,
}

// Safety: the mapping is plain memory; only one fiber ever runs on it at a
// time, and the Fiber owning it enforces that through its state machine.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack with `size` usable bytes (rounded up to whole pages)
    /// plus one guard page below.
    pub fn new(size: usize) -> RuntimeResult<Stack> {
        let page = page_size();
        let usable = size.div_ceil(page).max(1) * page;
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::ResourceExhausted("fiber stack mmap"));
        }

        // Guard page at the low end; the stack grows down toward it.
        let ret = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(RuntimeError::ResourceExhausted("fiber stack guard page"));
        }

        Ok(Stack {
            base: base as *mut u8,
            total,
            usable,
        })
    }

    /// Highest address of the stack; initial stack pointer.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Lowest usable address (just above the guard page).
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(self.total - self.usable) }
    }

    /// Usable bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.usable
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_layout() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert_eq!(stack.size(), 64 * 1024);
        assert!(stack.top() > stack.bottom());
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.size());
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(16 * 1024).unwrap();
        unsafe {
            let p = stack.top().sub(8);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
            let low = stack.bottom();
            low.write(0xCD);
            assert_eq!(low.read(), 0xCD);
        }
    }

    #[test]
    fn test_rounds_up_to_page() {
        let stack = Stack::new(1).unwrap();
        assert!(stack.size() >= 1);
        assert_eq!(stack.size() % page_size(), 0);
    }
}
