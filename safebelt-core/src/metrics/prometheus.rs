//! Prometheus metrics for safebelt
//!
//! Exposes metrics in Prometheus format for monitoring and observability.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry for safebelt metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Engine Metrics ==============

    /// Submissions counter with outcome label (ok, rejected, failed, cancelled)
    pub static ref SUBMISSIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("submissions_total", "Total items submitted to coalescing engines")
            .namespace("safebelt"),
        &["status"]
    ).expect("metric can be created");

    /// Sealed groups counter with reason label (capacity, timeout)
    pub static ref GROUPS_SEALED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("groups_sealed_total", "Total groups sealed")
            .namespace("safebelt"),
        &["reason"]
    ).expect("metric can be created");

    /// Group size histogram
    pub static ref GROUP_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new("group_size", "Items per downstream call")
            .namespace("safebelt")
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0])
    ).expect("metric can be created");

    /// Downstream duration histogram with status label
    pub static ref DOWNSTREAM_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "downstream_duration_seconds",
            "Downstream operation duration in seconds"
        )
        .namespace("safebelt")
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["status"]
    ).expect("metric can be created");

    // ============== Collaborator Metrics ==============

    /// Retry attempts counter with outcome label
    pub static ref RETRY_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("retry_attempts_total", "Total attempts made by retry policies")
            .namespace("safebelt"),
        &["status"]
    ).expect("metric can be created");

    /// Circuit breaker state transitions with target state label
    pub static ref BREAKER_TRANSITIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("breaker_transitions_total", "Total circuit breaker state transitions")
            .namespace("safebelt"),
        &["state"]
    ).expect("metric can be created");

    /// Calls rejected by an open circuit
    pub static ref BREAKER_REJECTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("breaker_rejected_total", "Total calls rejected by an open circuit")
            .namespace("safebelt"),
        &["breaker"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Should be called once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    // Engine metrics
    REGISTRY.register(Box::new(SUBMISSIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GROUPS_SEALED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(GROUP_SIZE.clone()))?;
    REGISTRY.register(Box::new(DOWNSTREAM_DURATION_SECONDS.clone()))?;

    // Collaborator metrics
    REGISTRY.register(Box::new(RETRY_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BREAKER_TRANSITIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BREAKER_REJECTED_TOTAL.clone()))?;

    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// Record the final status of one submit call.
pub fn record_submission(status: &str) {
    SUBMISSIONS_TOTAL.with_label_values(&[status]).inc();
}

/// Record a sealed group.
pub fn record_group_sealed(reason: &str) {
    GROUPS_SEALED_TOTAL.with_label_values(&[reason]).inc();
}

/// Record one downstream call.
pub fn record_downstream(group_size: usize, elapsed: Duration, succeeded: bool) {
    let status = if succeeded { "ok" } else { "error" };
    GROUP_SIZE.observe(group_size as f64);
    DOWNSTREAM_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(elapsed.as_secs_f64());
}

/// Record one retry attempt.
pub fn record_retry_attempt(succeeded: bool) {
    let status = if succeeded { "ok" } else { "error" };
    RETRY_ATTEMPTS_TOTAL.with_label_values(&[status]).inc();
}

/// Record a circuit breaker moving to `state`.
pub fn record_breaker_transition(state: &str) {
    BREAKER_TRANSITIONS_TOTAL.with_label_values(&[state]).inc();
}

/// Record a call rejected by an open circuit.
pub fn record_breaker_rejection(breaker: &str) {
    BREAKER_REJECTED_TOTAL.with_label_values(&[breaker]).inc();
}
