//! Circuit breaking for downstream operations.
//!
//! [`CircuitBreakerStatistics`] keeps pass/fail counts in a sliding window of
//! time buckets. [`CircuitBreaker`] uses them to stop calling an operation that
//! keeps failing and probes it again after a cool-down.

mod breaker;
mod statistics;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState, ENV_BREAKER_FAILURE_RATIO,
    ENV_BREAKER_MIN_REQUESTS, ENV_BREAKER_OPEN_MS,
};
pub use statistics::CircuitBreakerStatistics;
