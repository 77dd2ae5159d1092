//! Retry with backoff.
//!
//! A [`RetryPolicy`] calls an async operation up to `attempts` times and sleeps
//! between failed attempts according to a [`BackoffStrategy`]. [`wrap`] turns a
//! single-argument operation into one that retries transparently, which is how
//! the coalescing engine's downstream call is usually protected.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use safebelt_core::retry::{self, RetryPolicy};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::with_jitter_backoff(
//!     3,
//!     Duration::from_millis(50),
//!     Duration::from_secs(1),
//! )?;
//! let fetch = retry::wrap(
//!     |ids: Vec<u32>| async move { Ok::<_, std::io::Error>(ids.len()) },
//!     policy,
//! );
//! assert_eq!(fetch(vec![1, 2, 3]).await?, 3);
//! # Ok(())
//! # }
//! ```

mod backoff;
mod config;
mod policy;

pub use backoff::{BackoffStrategy, ExponentialBackoff, FixedBackoff, JitterBackoff, UniformSource};
pub use config::{RetryConfig, ENV_RETRY_ATTEMPTS, ENV_RETRY_BASE_DELAY_MS, ENV_RETRY_MAX_DELAY_MS};
pub use policy::{wrap, RetryPolicy};
