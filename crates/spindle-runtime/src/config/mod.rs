//! Runtime configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Environment variables (runtime)
//! 2. File named by `SPINDLE_CONFIG_RS` at build time
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use spindle_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .threads(4)
//!     .max_timeout(Duration::from_millis(500));
//! config.validate()?;
//! ```

pub mod defaults;

use spindle_core::constants::MIN_STACK_SIZE;
use spindle_core::env::{env_get, env_get_bool};
use spindle_core::ConfigError;
use std::sync::OnceLock;
use std::time::Duration;

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Threads driving a scheduler, including the caller in `use_caller` mode
    pub threads: usize,
    /// Default fiber stack size in bytes
    pub stack_size: usize,
    /// Events fetched per `epoll_wait`
    pub max_events: usize,
    /// Upper bound on a single `epoll_wait`
    pub max_timeout: Duration,
    /// Timeout applied by the hooked `connect`, `None` waits forever
    pub tcp_connect_timeout: Option<Duration>,
    /// Initial size of the per-descriptor tables
    pub fd_table_size: usize,
    /// Enable syscall hooks on I/O manager threads
    pub hook_enable: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `SPINDLE_THREADS`
    /// - `SPINDLE_STACK_SIZE`
    /// - `SPINDLE_MAX_EVENTS`
    /// - `SPINDLE_MAX_TIMEOUT_MS`
    /// - `SPINDLE_TCP_CONNECT_TIMEOUT_MS` (0 disables the timeout)
    /// - `SPINDLE_FD_TABLE_SIZE`
    /// - `SPINDLE_HOOK_ENABLE` (0/1)
    pub fn from_env() -> Self {
        let connect_ms = env_get("SPINDLE_TCP_CONNECT_TIMEOUT_MS", defaults::TCP_CONNECT_TIMEOUT_MS);
        Self {
            threads: env_get("SPINDLE_THREADS", defaults::THREADS),
            stack_size: env_get("SPINDLE_STACK_SIZE", defaults::STACK_SIZE),
            max_events: env_get("SPINDLE_MAX_EVENTS", defaults::MAX_EVENTS),
            max_timeout: Duration::from_millis(env_get(
                "SPINDLE_MAX_TIMEOUT_MS",
                defaults::MAX_TIMEOUT_MS,
            )),
            tcp_connect_timeout: (connect_ms > 0).then(|| Duration::from_millis(connect_ms)),
            fd_table_size: env_get("SPINDLE_FD_TABLE_SIZE", defaults::FD_TABLE_SIZE),
            hook_enable: env_get_bool("SPINDLE_HOOK_ENABLE", defaults::HOOK_ENABLE),
        }
    }

    /// Compile-time defaults only, ignoring the environment.
    pub fn new() -> Self {
        Self {
            threads: defaults::THREADS,
            stack_size: defaults::STACK_SIZE,
            max_events: defaults::MAX_EVENTS,
            max_timeout: Duration::from_millis(defaults::MAX_TIMEOUT_MS),
            tcp_connect_timeout: Some(Duration::from_millis(defaults::TCP_CONNECT_TIMEOUT_MS)),
            fd_table_size: defaults::FD_TABLE_SIZE,
            hook_enable: defaults::HOOK_ENABLE,
        }
    }

    // Builder methods

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn max_timeout(mut self, d: Duration) -> Self {
        self.max_timeout = d;
        self
    }

    pub fn tcp_connect_timeout(mut self, d: Option<Duration>) -> Self {
        self.tcp_connect_timeout = d;
        self
    }

    pub fn fd_table_size(mut self, n: usize) -> Self {
        self.fd_table_size = n;
        self
    }

    pub fn hook_enable(mut self, enable: bool) -> Self {
        self.hook_enable = enable;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::InvalidValue("threads must be > 0"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.max_timeout.is_zero() || self.max_timeout.as_millis() > i32::MAX as u128 {
            return Err(ConfigError::InvalidValue("max_timeout must be in 1..=i32::MAX ms"));
        }
        if self.fd_table_size == 0 {
            return Err(ConfigError::InvalidValue("fd_table_size must be > 0"));
        }
        Ok(())
    }
}

static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-wide configuration, read from the environment on first use
pub fn global() -> &'static RuntimeConfig {
    GLOBAL.get_or_init(RuntimeConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::new();
        assert_eq!(config.max_events, 256);
        assert_eq!(config.max_timeout, Duration::from_millis(3000));
        assert_eq!(config.stack_size, 128 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .threads(4)
            .max_timeout(Duration::from_millis(50))
            .tcp_connect_timeout(None)
            .hook_enable(false);

        assert_eq!(config.threads, 4);
        assert_eq!(config.max_timeout, Duration::from_millis(50));
        assert!(config.tcp_connect_timeout.is_none());
        assert!(!config.hook_enable);
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().threads(0).validate().is_err());
        assert!(RuntimeConfig::new().stack_size(4096).validate().is_err());
        assert!(RuntimeConfig::new().max_timeout(Duration::ZERO).validate().is_err());
        assert!(RuntimeConfig::new().max_events(0).validate().is_err());
    }
}
