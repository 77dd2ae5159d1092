//! Retry policy and operation wrapper.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::backoff::{BackoffStrategy, ExponentialBackoff, FixedBackoff, JitterBackoff};
use crate::error::ConfigError;
use crate::metrics::prometheus;

/// Retries a fallible async operation with a backoff between attempts
#[derive(Clone)]
pub struct RetryPolicy {
    attempts: u32,
    backoff: Arc<dyn BackoffStrategy>,
}

impl RetryPolicy {
    /// Policy making at most `attempts` calls; jitter backoff of one second
    pub fn new(attempts: u32) -> Result<Self, ConfigError> {
        Self::with_backoff(attempts, JitterBackoff::new(Duration::from_secs(1)))
    }

    /// Policy with an explicit backoff strategy
    pub fn with_backoff(
        attempts: u32,
        backoff: impl BackoffStrategy + 'static,
    ) -> Result<Self, ConfigError> {
        if attempts < 1 {
            return Err(ConfigError::InvalidAttempts(attempts));
        }
        Ok(Self {
            attempts,
            backoff: Arc::new(backoff),
        })
    }

    /// Full-jitter exponential backoff capped at `max_delay`
    pub fn with_jitter_backoff(
        attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, ConfigError> {
        Self::with_backoff(attempts, JitterBackoff::capped(base_delay, max_delay)?)
    }

    /// Plain exponential backoff capped at `max_delay`
    pub fn with_exponential_backoff(
        attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, ConfigError> {
        Self::with_backoff(attempts, ExponentialBackoff::capped(base_delay, max_delay)?)
    }

    /// Constant delay between attempts
    pub fn with_fixed_backoff(attempts: u32, delay: Duration) -> Result<Self, ConfigError> {
        Self::with_backoff(attempts, FixedBackoff::new(delay))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay the policy waits after the failed attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Run `operation` until it succeeds or attempts run out
    pub async fn run<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_if(operation, |_| true).await
    }

    /// Like [`run`](Self::run), retrying only failures `should_retry` accepts
    ///
    /// A rejected failure is returned immediately, as is the last attempt's.
    pub async fn run_if<T, E, F, Fut, P>(&self, mut operation: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let last_attempt = self.attempts - 1;
        let mut attempt = 0;

        loop {
            tracing::debug!(attempt, "Attempt #{}", attempt);

            let err = match operation().await {
                Ok(value) => {
                    prometheus::record_retry_attempt(true);
                    return Ok(value);
                }
                Err(err) => err,
            };
            prometheus::record_retry_attempt(false);
            tracing::warn!(attempt, error = %err, "Attempt #{} failed", attempt);

            if attempt >= last_attempt || !should_retry(&err) {
                return Err(err);
            }

            // First retry waits delay(0), the bare base delay
            tokio::time::sleep(self.backoff.delay(attempt)).await;
            attempt += 1;
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

/// Wrap a single-argument operation so every call goes through `policy`
///
/// The result has the same shape as `operation` and can be handed straight
/// to a coalescing engine as its downstream operation.
pub fn wrap<A, T, E, F, Fut>(
    operation: F,
    policy: RetryPolicy,
) -> impl Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync + 'static
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let operation = Arc::new(operation);
    move |arg: A| {
        let operation = Arc::clone(&operation);
        let policy = policy.clone();
        async move { policy.run(|| operation(arg.clone())).await }.boxed()
    }
}
