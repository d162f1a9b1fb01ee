//! Architecture-specific context switching
//!
//! Each backend exposes the same three items:
//! - `Context`: callee-saved registers of a suspended execution context
//! - `init_context`: prepare a fresh stack so the first switch enters `entry(arg)`
//! - `context_switch`: save the running context into `old`, resume `new`

/// Entry point of a fresh context. It must never return.
pub type EntryFn = extern "C" fn(usize) -> !;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{context_switch, init_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{context_switch, init_context, Context};
    } else {
        compile_error!("spindle supports x86_64 and aarch64 only");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Stack;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);

    struct Pair {
        main: Context,
        child: Context,
    }

    extern "C" fn bounce(arg: usize) -> ! {
        let pair = arg as *mut Pair;
        loop {
            HITS.fetch_add(1, Ordering::SeqCst);
            unsafe { context_switch(&mut (*pair).child, &(*pair).main) };
        }
    }

    #[test]
    fn test_switch_round_trip() {
        let stack = Stack::allocate(64 * 1024).unwrap();
        let mut pair = Box::new(Pair {
            main: Context::default(),
            child: Context::default(),
        });
        let raw: *mut Pair = &mut *pair;
        unsafe {
            init_context(&mut (*raw).child, stack.top(), bounce, raw as usize);
            for expected in 1..=3 {
                context_switch(&mut (*raw).main, &(*raw).child);
                assert_eq!(HITS.load(Ordering::SeqCst), expected);
            }
        }
    }
}
