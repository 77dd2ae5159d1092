//! Metrics module for safebelt
//!
//! Provides process-wide Prometheus metrics for monitoring and observability.
//! Per-engine counters live in [`crate::batching::BatchingMetrics`].

pub mod prometheus;

// Re-export commonly used items
pub use self::prometheus::{
    encode_metrics, record_breaker_rejection, record_breaker_transition, record_downstream,
    record_group_sealed, record_retry_attempt, record_submission, register_metrics,
    GROUPS_SEALED_TOTAL, SUBMISSIONS_TOTAL,
};
