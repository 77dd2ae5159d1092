//! Configuration for the coalescing engine.

use std::time::Duration;

use crate::error::{parse_env, ConfigError};

/// Environment variable overriding [`BatchingConfig::capacity`]
pub const ENV_CAPACITY: &str = "SAFEBELT_BATCH_CAPACITY";
/// Environment variable overriding [`BatchingConfig::timeout`], in milliseconds
pub const ENV_TIMEOUT_MS: &str = "SAFEBELT_BATCH_TIMEOUT_MS";

/// Configuration for the coalescing engine
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BatchingConfig {
    /// Maximum number of items in one group
    /// A group reaching this size is sealed immediately
    pub capacity: usize,

    /// Maximum time a group stays open after its first item
    pub timeout: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            timeout: Duration::from_millis(50),
        }
    }
}

impl BatchingConfig {
    /// Create a config with explicit values
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self { capacity, timeout }
    }

    /// Create config optimized for low latency (small groups, short window)
    pub fn low_latency() -> Self {
        Self {
            capacity: 8,
            timeout: Duration::from_millis(5),
        }
    }

    /// Create config optimized for high throughput (large groups, longer window)
    pub fn high_throughput() -> Self {
        Self {
            capacity: 256,
            timeout: Duration::from_millis(200),
        }
    }

    /// Create config from environment variables, starting from defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(capacity) = parse_env(ENV_CAPACITY)? {
            config.capacity = capacity;
        }
        if let Some(ms) = parse_env::<u64>(ENV_TIMEOUT_MS)? {
            config.timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BatchingConfig::default();
        assert_eq!(config.capacity, 32);
        assert_eq!(config.timeout, Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        let low = BatchingConfig::low_latency();
        let high = BatchingConfig::high_throughput();
        assert!(low.capacity < high.capacity);
        assert!(low.timeout < high.timeout);
        assert!(low.validate().is_ok());
        assert!(high.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let config = BatchingConfig::new(0, Duration::from_millis(10));
        assert_eq!(config.validate(), Err(ConfigError::ZeroCapacity));

        let config = BatchingConfig::new(4, Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout));
    }

    // Only test in the crate touching the batching variables
    #[test]
    fn test_from_env_overrides_and_rejects() {
        std::env::set_var(ENV_CAPACITY, " 12 ");
        std::env::set_var(ENV_TIMEOUT_MS, "75");
        let config = BatchingConfig::from_env().unwrap();
        assert_eq!(config, BatchingConfig::new(12, Duration::from_millis(75)));

        std::env::set_var(ENV_TIMEOUT_MS, "soon");
        assert_eq!(
            BatchingConfig::from_env(),
            Err(ConfigError::env(ENV_TIMEOUT_MS, "soon"))
        );

        std::env::set_var(ENV_TIMEOUT_MS, "0");
        assert_eq!(BatchingConfig::from_env(), Err(ConfigError::ZeroTimeout));

        std::env::remove_var(ENV_CAPACITY);
        std::env::remove_var(ENV_TIMEOUT_MS);
    }
}
