//! Error types for the spindle runtime

use crate::event::Event;
use crate::state::FiberState;
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Recoverable runtime errors
///
/// Process-invariant violations (a fiber resumed while already executing,
/// a trampoline returning, a failed stack mapping inside `Fiber::new`)
/// abort instead of surfacing here.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to map a {size} byte fiber stack: {source}")]
    StackAllocation {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("event {event} already registered on fd {fd}")]
    EventAlreadyRegistered { fd: i32, event: Event },

    #[error("epoll_ctl({op}) failed on fd {fd}: {source}")]
    Epoll {
        op: &'static str,
        fd: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid fiber state {found}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        found: FiberState,
    },

    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = RuntimeError::EventAlreadyRegistered { fd: 7, event: Event::READ };
        assert_eq!(e.to_string(), "event READ already registered on fd 7");

        let e = RuntimeError::InvalidState {
            expected: "INIT|TERM|EXCEPT",
            found: FiberState::Exec,
        };
        assert_eq!(e.to_string(), "invalid fiber state EXEC, expected INIT|TERM|EXCEPT");
    }

    #[test]
    fn test_config_conversion() {
        let e: RuntimeError = ConfigError::InvalidValue("threads must be > 0").into();
        assert_eq!(e.to_string(), "invalid config: threads must be > 0");
    }
}
