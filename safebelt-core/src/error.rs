//! Error types for the safebelt core library
//!
//! This module provides structured error types using `thiserror` for
//! type-safe error handling across the library.
//!
//! # Error Hierarchy
//!
//! ```text
//! ConfigError        - Constructor-time validation (capacity, timeout, backoff, thresholds)
//! BatchError<E>      - Per-caller failures of CoalescingEngine::submit
//! ├── Rejected       - An empty group refused its first item
//! ├── Downstream     - The group's downstream call failed (shared by every waiter)
//! ├── MissingResult  - The distribution strategy had no slice for this caller
//! └── Cancelled      - The wait was cancelled or the group was abandoned
//! CircuitError<E>    - Failures surfaced by a guarded operation
//! ```
//!
//! # Usage
//!
//! Library code returns these types directly. Application code should use
//! `anyhow` with context:
//!
//! ```rust,ignore
//! use anyhow::Context;
//!
//! let engine = CoalescingEngine::unpacking(op, config)
//!     .context("Invalid batching configuration")?;
//! ```

use std::sync::Arc;

use thiserror::Error;

/// Errors raised while validating configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Group capacity of zero would reject every item
    #[error("Group capacity must be at least 1")]
    ZeroCapacity,

    /// A zero seal timeout would close every group immediately
    #[error("Group timeout must be greater than zero")]
    ZeroTimeout,

    /// Retry attempts lower than 1
    #[error("Attempts must be at least 1, got {0}")]
    InvalidAttempts(u32),

    /// Backoff parameters out of range
    #[error("Invalid backoff: {0}")]
    InvalidBackoff(String),

    /// A ratio or count threshold out of range
    #[error("Invalid threshold '{name}': {message}")]
    InvalidThreshold { name: String, message: String },

    /// An environment variable was set but could not be parsed
    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: String, value: String },
}

impl ConfigError {
    /// Create a backoff error
    pub fn backoff(msg: impl Into<String>) -> Self {
        Self::InvalidBackoff(msg.into())
    }

    /// Create a threshold error
    pub fn threshold(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidThreshold {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an environment parsing error
    pub fn env(var: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidEnv {
            var: var.into(),
            value: value.into(),
        }
    }
}

/// Parse an optional environment variable, `None` when unset
pub(crate) fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::env(var, &val)),
        Err(_) => Ok(None),
    }
}

/// Errors returned to a single caller of `CoalescingEngine::submit`
///
/// `E` is the downstream operation's error type. A downstream failure is
/// stored once per group and handed to every waiter behind an `Arc`, so all
/// of them observe the same kind, message and `source()` chain.
#[derive(Error, Debug)]
pub enum BatchError<E> {
    /// A freshly created, empty group rejected its first item
    #[error("Item rejected by an empty group (capacity {capacity})")]
    Rejected { capacity: usize },

    /// The downstream operation failed for the whole group
    #[error("Downstream operation failed: {0}")]
    Downstream(#[source] Arc<E>),

    /// The distribution strategy produced no value for this caller
    #[error("No result for item {index} in a group of {group_size}")]
    MissingResult { index: usize, group_size: usize },

    /// The caller stopped waiting, or the group was abandoned before publishing
    #[error("Cancelled before the group result was available")]
    Cancelled,
}

impl<E> BatchError<E> {
    /// Borrow the downstream failure, if this is one
    pub fn downstream(&self) -> Option<&E> {
        match self {
            Self::Downstream(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// Whether this error came from cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors surfaced by an operation wrapped with `CircuitBreaker::guarded`
#[derive(Error, Debug)]
pub enum CircuitError<E> {
    /// The circuit is open; the operation was not invoked
    #[error("Circuit is open, call rejected")]
    Open,

    /// The operation ran and failed
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Whether the call was rejected without reaching the operation
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Unwrap the operation's own error, if the call reached it
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(err) => Some(err),
            Self::Open => None,
        }
    }
}
