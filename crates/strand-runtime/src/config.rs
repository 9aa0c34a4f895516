//! Runtime configuration
//!
//! Compile-time defaults with environment overrides, builder-style.
//!
//! # Environment variables (all optional)
//!
//! - `STRAND_STACK_SIZE` - virtual stack bytes per fiber
//! - `STRAND_MAX_FIBERS` - slot-table capacity
//! - `STRAND_MAX_CHANS` - channel-arena soft cap

use strand_core::env::env_get;
use strand_core::MIN_STACK_SIZE;

/// Library defaults
pub mod defaults {
    /// Virtual stack per fiber; physical pages are faulted in on demand
    pub const STACK_SIZE: usize = 1024 * 1024;
    pub const MAX_FIBERS: usize = 1024;
    pub const MAX_CHANS: usize = 65536;
}

/// Runtime configuration with builder pattern
///
/// Use `from_env()` to start with defaults and apply environment
/// overrides.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Virtual stack size per fiber
    pub stack_size: usize,
    /// Maximum concurrent fibers (slot-table capacity)
    pub max_fibers: usize,
    /// Maximum live channels
    pub max_chans: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("STRAND_STACK_SIZE", defaults::STACK_SIZE),
            max_fibers: env_get("STRAND_MAX_FIBERS", defaults::MAX_FIBERS),
            max_chans: env_get("STRAND_MAX_CHANS", defaults::MAX_CHANS),
        }
    }

    /// Explicit defaults, no environment lookup
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            max_fibers: defaults::MAX_FIBERS,
            max_chans: defaults::MAX_CHANS,
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn max_fibers(mut self, n: usize) -> Self {
        self.max_fibers = n;
        self
    }

    pub fn max_chans(mut self, n: usize) -> Self {
        self.max_chans = n;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 256KB"));
        }
        if self.stack_size % strand_core::PAGE_SIZE != 0 {
            return Err(ConfigError::InvalidValue(
                "stack_size must be page aligned",
            ));
        }
        if self.max_fibers < 2 {
            return Err(ConfigError::InvalidValue("max_fibers must be >= 2"));
        }
        if self.max_chans == 0 {
            return Err(ConfigError::InvalidValue("max_chans must be > 0"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_valid() {
        let config = RuntimeConfig::from_env();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .stack_size(512 * 1024)
            .max_fibers(64);
        assert_eq!(config.stack_size, 512 * 1024);
        assert_eq!(config.max_fibers, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().stack_size(4096).validate().is_err());
        assert!(RuntimeConfig::new().max_fibers(1).validate().is_err());
        assert!(RuntimeConfig::new()
            .stack_size(256 * 1024 + 1)
            .validate()
            .is_err());
    }
}
