//! Backoff strategies.
//!
//! - [`FixedBackoff`]: the same delay before every retry
//! - [`ExponentialBackoff`]: binary exponential backoff, `base * 2^attempt`
//! - [`JitterBackoff`]: "full jitter", a uniform draw in `[0, base * 2^attempt]`
//!
//! All strategies are capped. Full jitter follows
//! <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::ConfigError;

/// Maps a 0-based attempt number to the delay before the next attempt
pub trait BackoffStrategy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

fn check_bounds(base_delay: Duration, cap: Duration) -> Result<(), ConfigError> {
    if base_delay > cap {
        return Err(ConfigError::backoff(format!(
            "base delay {:?} exceeds cap {:?}",
            base_delay, cap
        )));
    }
    Ok(())
}

/// Constant delay between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Binary exponential backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    cap: Duration,
}

impl ExponentialBackoff {
    /// Uncapped exponential backoff
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            cap: Duration::MAX,
        }
    }

    /// Exponential backoff never exceeding `cap`
    pub fn capped(base_delay: Duration, cap: Duration) -> Result<Self, ConfigError> {
        check_bounds(base_delay, cap)?;
        Ok(Self { base_delay, cap })
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Source of uniform samples for [`JitterBackoff`]
pub trait UniformSource: Send {
    /// Sample uniformly from `[low, high]`
    fn uniform(&mut self, low: f64, high: f64) -> f64;
}

impl UniformSource for StdRng {
    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        self.gen_range(low..=high)
    }
}

/// Exponential backoff with full jitter
pub struct JitterBackoff<U = StdRng> {
    base_delay: Duration,
    cap: Duration,
    source: Mutex<U>,
}

impl JitterBackoff<StdRng> {
    /// Uncapped jitter backoff seeded from the OS
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            cap: Duration::MAX,
            source: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Jitter backoff never exceeding `cap`, seeded from the OS
    pub fn capped(base_delay: Duration, cap: Duration) -> Result<Self, ConfigError> {
        Self::with_source(StdRng::from_entropy(), base_delay, cap)
    }
}

impl<U: UniformSource> JitterBackoff<U> {
    /// Jitter backoff drawing from an explicit source
    pub fn with_source(source: U, base_delay: Duration, cap: Duration) -> Result<Self, ConfigError> {
        check_bounds(base_delay, cap)?;
        Ok(Self {
            base_delay,
            cap,
            source: Mutex::new(source),
        })
    }
}

impl<U: UniformSource> BackoffStrategy for JitterBackoff<U> {
    fn delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        // 2^attempt overflows f64 from attempt 1024 on
        let upper = 2f64.powi(attempt.min(i32::MAX as u32) as i32);
        if !upper.is_finite() {
            return self.cap;
        }

        let factor = self
            .source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .uniform(0.0, upper);

        Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl<U> std::fmt::Debug for JitterBackoff<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitterBackoff")
            .field("base_delay", &self.base_delay)
            .field("cap", &self.cap)
            .finish_non_exhaustive()
    }
}
