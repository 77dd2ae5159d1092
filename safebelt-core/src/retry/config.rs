//! Configuration for retry policies.

use std::time::Duration;

use super::policy::RetryPolicy;
use crate::error::{parse_env, ConfigError};

/// Environment variable overriding [`RetryConfig::attempts`]
pub const ENV_RETRY_ATTEMPTS: &str = "SAFEBELT_RETRY_ATTEMPTS";
/// Environment variable overriding [`RetryConfig::base_delay`], in milliseconds
pub const ENV_RETRY_BASE_DELAY_MS: &str = "SAFEBELT_RETRY_BASE_DELAY_MS";
/// Environment variable overriding [`RetryConfig::max_delay`], in milliseconds
pub const ENV_RETRY_MAX_DELAY_MS: &str = "SAFEBELT_RETRY_MAX_DELAY_MS";

/// Configuration for a [`RetryPolicy`]
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RetryConfig {
    /// Maximum number of calls, the first one included
    pub attempts: u32,

    /// Delay unit multiplied by `2^attempt`
    pub base_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Draw delays with full jitter instead of plain exponential growth
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create config from environment variables, starting from defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(attempts) = parse_env(ENV_RETRY_ATTEMPTS)? {
            config.attempts = attempts;
        }
        if let Some(ms) = parse_env(ENV_RETRY_BASE_DELAY_MS)? {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env(ENV_RETRY_MAX_DELAY_MS)? {
            config.max_delay = Duration::from_millis(ms);
        }

        config.build()?;
        Ok(config)
    }

    /// Build the policy this config describes
    pub fn build(&self) -> Result<RetryPolicy, ConfigError> {
        if self.jitter {
            RetryPolicy::with_jitter_backoff(self.attempts, self.base_delay, self.max_delay)
        } else {
            RetryPolicy::with_exponential_backoff(self.attempts, self.base_delay, self.max_delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        let config = RetryConfig::default();
        let policy = config.build().unwrap();
        assert_eq!(policy.attempts(), 3);
        assert!(policy.delay(10) <= config.max_delay);
    }

    #[test]
    fn test_build_rejects_invalid_values() {
        let config = RetryConfig {
            attempts: 0,
            ..Default::default()
        };
        assert_eq!(config.build().unwrap_err(), ConfigError::InvalidAttempts(0));

        let config = RetryConfig {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            jitter: false,
            ..Default::default()
        };
        assert!(matches!(config.build(), Err(ConfigError::InvalidBackoff(_))));
    }

    #[test]
    fn test_exponential_schedule_from_config() {
        let config = RetryConfig {
            attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            jitter: false,
        };
        let policy = config.build().unwrap();

        let delays: Vec<_> = (0..4).map(|a| policy.delay(a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }
}
