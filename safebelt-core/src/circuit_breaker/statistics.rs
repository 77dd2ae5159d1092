//! Sliding-window pass/fail statistics.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    index: u64,
    passed: u64,
    failed: u64,
}

/// Pass/fail counts over the last `buckets_count * bucket_interval`
///
/// Time is split into fixed buckets starting at construction. Counts land in
/// the bucket covering "now"; buckets older than the window are dropped.
#[derive(Debug)]
pub struct CircuitBreakerStatistics {
    buckets: VecDeque<Bucket>,
    buckets_count: usize,
    bucket_interval: Duration,
    epoch: Instant,
}

impl CircuitBreakerStatistics {
    pub fn new(buckets_count: usize, bucket_interval: Duration) -> Result<Self, ConfigError> {
        if buckets_count == 0 {
            return Err(ConfigError::threshold("buckets_count", "must be at least 1"));
        }
        if bucket_interval.is_zero() {
            return Err(ConfigError::threshold("bucket_interval", "must be positive"));
        }
        Ok(Self {
            buckets: VecDeque::with_capacity(buckets_count),
            buckets_count,
            bucket_interval,
            epoch: Instant::now(),
        })
    }

    /// Length of the whole window
    pub fn window(&self) -> Duration {
        self.bucket_interval * self.buckets_count as u32
    }

    fn current_index(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.epoch);
        (elapsed.as_nanos() / self.bucket_interval.as_nanos()) as u64
    }

    fn expire(&mut self, current: u64) {
        let oldest = current.saturating_sub(self.buckets_count as u64 - 1);
        while self.buckets.front().is_some_and(|b| b.index < oldest) {
            self.buckets.pop_front();
        }
    }

    /// Add counts to the bucket covering the current instant
    pub fn add_stats(&mut self, passed: u64, failed: u64) {
        let current = self.current_index();
        self.expire(current);

        match self.buckets.back_mut() {
            Some(bucket) if bucket.index == current => {
                bucket.passed += passed;
                bucket.failed += failed;
            }
            _ => self.buckets.push_back(Bucket {
                index: current,
                passed,
                failed,
            }),
        }
    }

    /// `(passed, failed)` summed over the buckets still inside the window
    pub fn evaluate(&mut self) -> (u64, u64) {
        let current = self.current_index();
        self.expire(current);

        self.buckets
            .iter()
            .fold((0, 0), |(passed, failed), b| (passed + b.passed, failed + b.failed))
    }

    /// Forget every bucket
    pub fn reset(&mut self) {
        self.buckets.clear();
    }
}
