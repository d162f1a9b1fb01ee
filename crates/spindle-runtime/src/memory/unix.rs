//! Unix stack implementation using mmap

use super::page_align;
use spindle_core::RuntimeError;
use std::io;
use std::ptr::NonNull;

/// An mmap'd fiber stack with a PROT_NONE guard page below it
///
/// ```text
/// base                base + guard                         base + len
///  | guard (no access) |  usable stack (grows downward)  <- top |
/// ```
pub struct Stack {
    base: NonNull<u8>,
    len: usize,
    guard: usize,
}

// The mapping is owned exclusively and only touched by the fiber running on it.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map at least `size` usable bytes plus one guard page
    pub fn allocate(size: usize) -> Result<Stack, RuntimeError> {
        let page = page_size();
        let usable = page_align(size.max(page), page);
        let len = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::StackAllocation {
                size,
                source: io::Error::last_os_error(),
            });
        }

        // Overflow into the lowest page faults instead of corrupting memory
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::munmap(base, len) };
            return Err(RuntimeError::StackAllocation { size, source });
        }

        let base = NonNull::new(base as *mut u8).ok_or_else(|| RuntimeError::StackAllocation {
            size,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        })?;

        Ok(Stack { base, len, guard: page })
    }

    /// One past the highest usable byte
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Usable bytes, excluding the guard page
    #[inline]
    pub fn size(&self) -> usize {
        self.len - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// System page size
pub fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}
