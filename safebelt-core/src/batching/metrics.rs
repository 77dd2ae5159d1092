//! Metrics for the coalescing engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Why a group stopped accepting items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealReason {
    /// The group reached its capacity
    Capacity,
    /// The seal timer fired while the group was still open
    Timeout,
}

impl SealReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SealReason::Capacity => "capacity",
            SealReason::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for SealReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics for monitoring engine behaviour
#[derive(Debug, Default)]
pub struct BatchingMetrics {
    /// Total items submitted
    pub items_submitted: AtomicU64,

    /// Items rejected because an empty group refused them
    pub items_rejected: AtomicU64,

    /// Groups sealed because they reached capacity
    pub groups_sealed_capacity: AtomicU64,

    /// Groups sealed by the timer
    pub groups_sealed_timeout: AtomicU64,

    /// Timers that fired after their group had already moved on
    pub stale_timers: AtomicU64,

    /// Downstream invocations (one per group)
    pub downstream_calls: AtomicU64,

    /// Downstream invocations that returned a failure
    pub downstream_failures: AtomicU64,

    /// Total items handed to the downstream operation (for group size averaging)
    pub items_batched: AtomicU64,

    /// Largest group handed to the downstream operation
    pub max_group_size: AtomicU64,

    /// Total downstream time in milliseconds (for averaging)
    pub total_downstream_ms: AtomicU64,

    /// Waiters that received Cancelled
    pub waiters_cancelled: AtomicU64,
}

impl BatchingMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an item entering the engine
    pub fn record_submitted(&self) {
        self.items_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an item refused by an empty group
    pub fn record_rejected(&self) {
        self.items_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a group being sealed
    pub fn record_sealed(&self, reason: SealReason) {
        match reason {
            SealReason::Capacity => self.groups_sealed_capacity.fetch_add(1, Ordering::Relaxed),
            SealReason::Timeout => self.groups_sealed_timeout.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a timer that found its group already sealed
    pub fn record_stale_timer(&self) {
        self.stale_timers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one downstream invocation
    pub fn record_downstream(&self, group_size: usize, elapsed: Duration, succeeded: bool) {
        self.downstream_calls.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.downstream_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.items_batched.fetch_add(group_size as u64, Ordering::Relaxed);
        self.total_downstream_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.max_group_size.fetch_max(group_size as u64, Ordering::Relaxed);
    }

    /// Record a waiter that gave up or lost its group
    pub fn record_cancelled(&self) {
        self.waiters_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of downstream invocations so far
    pub fn downstream_calls(&self) -> u64 {
        self.downstream_calls.load(Ordering::Relaxed)
    }

    /// Total groups sealed, by either reason
    pub fn groups_sealed(&self) -> u64 {
        self.groups_sealed_capacity.load(Ordering::Relaxed)
            + self.groups_sealed_timeout.load(Ordering::Relaxed)
    }

    /// Calculate average group size
    pub fn avg_group_size(&self) -> f64 {
        let calls = self.downstream_calls.load(Ordering::Relaxed);
        if calls == 0 {
            return 0.0;
        }
        let items = self.items_batched.load(Ordering::Relaxed);
        items as f64 / calls as f64
    }

    /// Calculate average downstream latency in milliseconds
    pub fn avg_downstream_ms(&self) -> f64 {
        let calls = self.downstream_calls.load(Ordering::Relaxed);
        if calls == 0 {
            return 0.0;
        }
        let total = self.total_downstream_ms.load(Ordering::Relaxed);
        total as f64 / calls as f64
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_submitted: self.items_submitted.load(Ordering::Relaxed),
            items_rejected: self.items_rejected.load(Ordering::Relaxed),
            groups_sealed_capacity: self.groups_sealed_capacity.load(Ordering::Relaxed),
            groups_sealed_timeout: self.groups_sealed_timeout.load(Ordering::Relaxed),
            stale_timers: self.stale_timers.load(Ordering::Relaxed),
            downstream_calls: self.downstream_calls.load(Ordering::Relaxed),
            downstream_failures: self.downstream_failures.load(Ordering::Relaxed),
            waiters_cancelled: self.waiters_cancelled.load(Ordering::Relaxed),
            max_group_size: self.max_group_size.load(Ordering::Relaxed),
            avg_group_size: self.avg_group_size(),
            avg_downstream_ms: self.avg_downstream_ms(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.items_submitted.store(0, Ordering::Relaxed);
        self.items_rejected.store(0, Ordering::Relaxed);
        self.groups_sealed_capacity.store(0, Ordering::Relaxed);
        self.groups_sealed_timeout.store(0, Ordering::Relaxed);
        self.stale_timers.store(0, Ordering::Relaxed);
        self.downstream_calls.store(0, Ordering::Relaxed);
        self.downstream_failures.store(0, Ordering::Relaxed);
        self.items_batched.store(0, Ordering::Relaxed);
        self.max_group_size.store(0, Ordering::Relaxed);
        self.total_downstream_ms.store(0, Ordering::Relaxed);
        self.waiters_cancelled.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub items_submitted: u64,
    pub items_rejected: u64,
    pub groups_sealed_capacity: u64,
    pub groups_sealed_timeout: u64,
    pub stale_timers: u64,
    pub downstream_calls: u64,
    pub downstream_failures: u64,
    pub waiters_cancelled: u64,
    pub max_group_size: u64,
    pub avg_group_size: f64,
    pub avg_downstream_ms: f64,
}
