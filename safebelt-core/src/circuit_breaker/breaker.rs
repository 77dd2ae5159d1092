//! Circuit breaker gate built on [`CircuitBreakerStatistics`].
//!
//! # State Machine
//!
//! ```text
//!   Closed ──(failure ratio >= threshold over >= minimum_requests calls)──> Open
//!   Open ──(open_interval elapsed)──> HalfOpen
//!   HalfOpen ──(probe succeeds)──> Closed
//!   HalfOpen ──(probe fails)──> Open
//! ```
//!
//! While half-open a single probe call is let through; concurrent callers are
//! rejected until the probe finishes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::time::Instant;

use super::statistics::CircuitBreakerStatistics;
use crate::error::{parse_env, CircuitError, ConfigError};
use crate::metrics::prometheus;

/// Environment variable overriding [`CircuitBreakerConfig::failure_ratio_threshold`]
pub const ENV_BREAKER_FAILURE_RATIO: &str = "SAFEBELT_BREAKER_FAILURE_RATIO";
/// Environment variable overriding [`CircuitBreakerConfig::minimum_requests`]
pub const ENV_BREAKER_MIN_REQUESTS: &str = "SAFEBELT_BREAKER_MIN_REQUESTS";
/// Environment variable overriding [`CircuitBreakerConfig::open_interval`], in milliseconds
pub const ENV_BREAKER_OPEN_MS: &str = "SAFEBELT_BREAKER_OPEN_MS";

/// Configuration for a [`CircuitBreaker`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerConfig {
    /// Label used in logs and Prometheus metrics
    pub name: String,

    /// Failure ratio in `(0, 1]` at which the circuit opens
    pub failure_ratio_threshold: f64,

    /// Calls that must be observed in the window before the ratio counts
    pub minimum_requests: u64,

    /// Number of buckets in the statistics window
    pub buckets_count: usize,

    /// Length of one bucket
    pub bucket_interval: Duration,

    /// Time the circuit stays open before a probe is allowed
    pub open_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "downstream".to_string(),
            failure_ratio_threshold: 0.5,
            minimum_requests: 10,
            buckets_count: 10,
            bucket_interval: Duration::from_secs(1),
            open_interval: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create config from environment variables, starting from defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ratio) = parse_env(ENV_BREAKER_FAILURE_RATIO)? {
            config.failure_ratio_threshold = ratio;
        }
        if let Some(minimum) = parse_env(ENV_BREAKER_MIN_REQUESTS)? {
            config.minimum_requests = minimum;
        }
        if let Some(ms) = parse_env(ENV_BREAKER_OPEN_MS)? {
            config.open_interval = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = self.failure_ratio_threshold;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::threshold(
                "failure_ratio_threshold",
                format!("must be in (0, 1], got {}", ratio),
            ));
        }
        if self.minimum_requests == 0 {
            return Err(ConfigError::threshold("minimum_requests", "must be at least 1"));
        }
        if self.open_interval.is_zero() {
            return Err(ConfigError::threshold("open_interval", "must be positive"));
        }
        Ok(())
    }
}

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through and are counted
    Closed,
    /// Calls are rejected without reaching the operation
    Open,
    /// One probe call decides whether to close again
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable breaker counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitMetrics {
    /// Transitions into `Open`, from either `Closed` or a failed probe
    pub trips: u64,
    /// Successful probes closing the circuit
    pub resets: u64,
    /// Calls refused while open or while a probe was running
    pub rejected: u64,
    /// Probe calls let through while half-open
    pub probes: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    statistics: CircuitBreakerStatistics,
}

#[derive(Debug)]
struct Inner {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    trips: AtomicU64,
    resets: AtomicU64,
    rejected: AtomicU64,
    probes: AtomicU64,
}

/// Gate failing fast while the protected operation keeps failing
///
/// Cloning is cheap; clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

/// Admission for one call, released when its outcome is recorded or dropped
struct Permit<'a> {
    inner: &'a Inner,
    probe: bool,
    recorded: bool,
}

impl Permit<'_> {
    fn record(mut self, succeeded: bool) {
        self.recorded = true;
        self.inner.on_result(self.probe, succeeded);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        // A cancelled probe frees the slot without deciding anything
        if self.probe && !self.recorded {
            self.inner.lock().probe_in_flight = false;
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        match to {
            CircuitState::Open => {
                state.opened_at = Some(Instant::now());
                self.trips.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(breaker = %self.config.name, %from, "Circuit opened");
            }
            CircuitState::Closed => {
                state.opened_at = None;
                state.statistics.reset();
                self.resets.fetch_add(1, Ordering::Relaxed);
                tracing::info!(breaker = %self.config.name, %from, "Circuit closed");
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %self.config.name, %from, "Circuit half-open, probing");
            }
        }
        prometheus::record_breaker_transition(to.as_str());
    }

    fn admit(&self) -> Option<Permit<'_>> {
        let mut state = self.lock();

        if state.state == CircuitState::Open {
            let cooled_down = state
                .opened_at
                .map_or(true, |at| at.elapsed() >= self.config.open_interval);
            if cooled_down {
                self.transition(&mut state, CircuitState::HalfOpen);
            }
        }

        let probe = match state.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !state.probe_in_flight => {
                state.probe_in_flight = true;
                self.probes.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                prometheus::record_breaker_rejection(&self.config.name);
                tracing::debug!(breaker = %self.config.name, state = %state.state, "Call rejected");
                return None;
            }
        };

        Some(Permit {
            inner: self,
            probe,
            recorded: false,
        })
    }

    fn on_result(&self, probe: bool, succeeded: bool) {
        let mut state = self.lock();
        state
            .statistics
            .add_stats(u64::from(succeeded), u64::from(!succeeded));

        if probe {
            state.probe_in_flight = false;
            if state.state == CircuitState::HalfOpen {
                let to = if succeeded {
                    CircuitState::Closed
                } else {
                    CircuitState::Open
                };
                self.transition(&mut state, to);
            }
            return;
        }

        if state.state != CircuitState::Closed || succeeded {
            return;
        }

        let (passed, failed) = state.statistics.evaluate();
        let total = passed + failed;
        if total >= self.config.minimum_requests
            && failed as f64 / total as f64 >= self.config.failure_ratio_threshold
        {
            tracing::debug!(passed, failed, "Failure ratio reached threshold");
            self.transition(&mut state, CircuitState::Open);
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let statistics = CircuitBreakerStatistics::new(config.buckets_count, config.bucket_interval)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    opened_at: None,
                    probe_in_flight: false,
                    statistics,
                }),
                trips: AtomicU64::new(0),
                resets: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                probes: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Current state; an open circuit whose interval elapsed reads as half-open
    pub fn state(&self) -> CircuitState {
        let state = self.inner.lock();
        match (state.state, state.opened_at) {
            (CircuitState::Open, Some(at)) if at.elapsed() >= self.inner.config.open_interval => {
                CircuitState::HalfOpen
            }
            (current, _) => current,
        }
    }

    /// `(passed, failed)` inside the current window
    pub fn statistics(&self) -> (u64, u64) {
        self.inner.lock().statistics.evaluate()
    }

    pub fn metrics(&self) -> CircuitMetrics {
        CircuitMetrics {
            trips: self.inner.trips.load(Ordering::Relaxed),
            resets: self.inner.resets.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            probes: self.inner.probes.load(Ordering::Relaxed),
        }
    }

    /// Run `operation` through the breaker
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.inner.admit().ok_or(CircuitError::Open)?;
        let result = operation().await;
        permit.record(result.is_ok());
        result.map_err(CircuitError::Inner)
    }

    /// Wrap a single-argument operation so every call goes through the breaker
    pub fn guarded<A, T, E, F, Fut>(
        &self,
        operation: F,
    ) -> impl Fn(A) -> BoxFuture<'static, Result<T, CircuitError<E>>> + Send + Sync + 'static
    where
        A: Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let breaker = self.clone();
        let operation = Arc::new(operation);
        move |arg: A| {
            let breaker = breaker.clone();
            let operation = Arc::clone(&operation);
            async move { breaker.call(|| operation(arg)).await }.boxed()
        }
    }
}
