//! # spindle-core
//!
//! Core types for the spindle fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Context switching, stacks, epoll and the hook layer live in
//! `spindle-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber lifecycle states
//! - `event` - Read/Write interest mask used by the I/O manager
//! - `error` - Error taxonomy
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod event;
pub mod error;
pub mod env;

// Re-exports for convenience
pub use id::FiberId;
pub use state::FiberState;
pub use event::Event;
pub use error::{ConfigError, Result, RuntimeError};
pub use env::{env_get, env_get_bool, env_get_str};

/// Runtime-wide constants
pub mod constants {
    /// Smallest fiber stack accepted by the configuration layer
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// A backwards clock jump larger than this expires every pending timer
    pub const CLOCK_ROLLOVER_MS: u64 = 60 * 60 * 1000;

    /// Worker index of a thread that is not owned by any scheduler
    pub const NO_WORKER: usize = usize::MAX;
}
