// Safebelt Core Library
//
// Request coalescing engine plus the retry and circuit-breaker collaborators
// that usually protect its downstream call

pub mod batching;
pub mod circuit_breaker;
pub mod error;
pub mod metrics;
pub mod retry;

pub use batching::{BatchingConfig, CoalescingEngine};
pub use error::{BatchError, CircuitError, ConfigError};

#[cfg(test)]
mod engine_tests;
