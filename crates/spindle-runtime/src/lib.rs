//! # spindle-runtime
//!
//! Linux implementation of the spindle fiber runtime.
//!
//! This crate provides:
//! - Fiber stacks (mmap with a guard page) and context switching
//!   (architecture-specific assembly)
//! - `Fiber`: stackful coroutines with resume/yield
//! - `Scheduler`: N:M scheduling of fibers and callbacks over a thread pool
//! - `TimerManager`: one-shot, recurring and condition timers
//! - `IoManager`: epoll readiness plus timers, driving parked fibers
//! - `hook`: blocking-style socket calls and sleeps that park the fiber
//!   instead of the thread

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("spindle-runtime requires Linux (epoll)");
    }
}

pub mod arch;
pub mod config;
pub mod fiber;
pub mod hook;
pub mod iomanager;
pub mod memory;
pub mod scheduler;
pub mod timer;
mod tls;

#[cfg(test)]
mod testutil;

// Re-exports
pub use config::RuntimeConfig;
pub use fiber::{Fiber, FiberBody};
pub use iomanager::IoManager;
pub use scheduler::{Schedule, Scheduler, SchedulerCore, SchedulerSwitcher, Task};
pub use timer::{Clock, ManualClock, MonotonicClock, Timer, TimerCallback, TimerListener, TimerManager};
