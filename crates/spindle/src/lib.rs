//! # spindle - stackful fibers over epoll
//!
//! A user-space concurrency runtime: stackful fibers, an N:M scheduler,
//! an epoll-based I/O manager with timers, and a hook layer that turns
//! blocking-style socket calls into fiber suspensions.
//!
//! ## Quick Start
//!
//! ```ignore
//! use spindle::{hook, IoManager, Schedule};
//!
//! fn main() -> spindle::Result<()> {
//!     spindle::init_logging();
//!     let iom = IoManager::new(2, true, "main")?;
//!
//!     iom.schedule_fn(|| {
//!         hook::sleep(1);          // parks the fiber, not the thread
//!         tracing::info!("woke up");
//!     });
//!
//!     iom.stop();                  // caller thread joins in, then drains
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        schedule_fn(), hook::read/write/sleep, timers        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      IoManager                              │
//! │   Scheduler run loops + epoll idle + TimerManager           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Caller   │
//!    │  Thread   │      │  Thread   │      │ (in stop) │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                       Fibers                            │
//!    │      mmap'd stacks, guard pages, assembly switches      │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use spindle_core::{ConfigError, Event, FiberId, FiberState, Result, RuntimeError};

// Re-export env utilities
pub use spindle_core::{env_get, env_get_bool, env_get_str};

// Re-export runtime types
pub use spindle_runtime::{
    hook, scheduler, Clock, Fiber, IoManager, ManualClock, MonotonicClock, RuntimeConfig,
    Schedule, Scheduler, SchedulerSwitcher, Task, Timer, TimerManager,
};

use tracing::Level;

/// Install a `tracing` fmt subscriber for binaries.
///
/// The level comes from `SPINDLE_LOG` (`error`, `warn`, `info`, `debug`,
/// `trace`), default `info`. Calling it twice is harmless.
pub fn init_logging() {
    let level = env_get_str("SPINDLE_LOG", "info")
        .parse::<Level>()
        .unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_names(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }

    #[test]
    fn test_facade_round_trip() {
        let config = RuntimeConfig::new()
            .threads(2)
            .max_timeout(std::time::Duration::from_millis(50));
        let iom = IoManager::with_config(config, false, "facade").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let hits = hits.clone();
            iom.schedule_fn(move || {
                Fiber::yield_to_ready();
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }
}
