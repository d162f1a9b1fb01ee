//! Fiber stack memory
//!
//! Platform-specific implementations handle virtual memory mapping.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::*;
    } else {
        compile_error!("spindle requires a unix platform");
    }
}

/// Round `size` up to a multiple of `page`
#[inline]
pub(crate) const fn page_align(size: usize, page: usize) -> usize {
    (size + page - 1) & !(page - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(1, 4096), 4096);
        assert_eq!(page_align(4096, 4096), 4096);
        assert_eq!(page_align(128 * 1024 + 1, 4096), 132 * 1024);
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::allocate(64 * 1024).unwrap();
        assert!(stack.size() >= 64 * 1024);
        unsafe {
            let top = stack.top();
            // Highest and lowest usable bytes
            top.sub(1).write(0xAB);
            top.sub(stack.size()).write(0xCD);
            assert_eq!(top.sub(1).read(), 0xAB);
        }
    }
}
