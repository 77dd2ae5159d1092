//! Request coalescing for safebelt.
//!
//! This module groups concurrently submitted items into bounded groups, runs
//! one downstream call per group and fans the result back out to every caller.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              submit(item) from many callers              │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │
//!                    ┌────────▼────────┐
//!                    │  Engine lock    │ ← accept / seal / rotate
//!                    │  ┌───────────┐  │
//!                    │  │ open group│  │ ← capacity or timer seals it
//!                    │  └───────────┘  │
//!                    └────────┬────────┘
//!                             │ sealed group
//!                    ┌────────▼────────┐
//!                    │  Downstream     │ ← exactly one call per group
//!                    └────────┬────────┘
//!                             │
//!                    ┌────────▼────────┐
//!                    │  GroupOutcome   │ ← value or failure, many waiters
//!                    └────────┬────────┘
//!                             │ distribution strategy
//!                    ┌────────▼────────┐
//!                    │ per-caller slice│
//!                    └─────────────────┘
//! ```
//!
//! # Features
//!
//! - **Capacity sealing**: a group closes the moment it holds `capacity` items
//! - **Timeout sealing**: a group closes `timeout` after its first item at the latest
//! - **Pipelining**: a new group fills up while the previous one executes
//! - **Shared failures**: one downstream error reaches every caller of the group
//! - **Metrics**: seal reasons, group sizes, downstream latency
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use safebelt_core::batching::{BatchingConfig, CoalescingEngine};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = CoalescingEngine::unpacking(
//!     |items: Vec<u64>| async move {
//!         Ok::<_, std::io::Error>(items.iter().map(|x| x + 10).collect())
//!     },
//!     BatchingConfig::new(4, Duration::from_millis(20)),
//! )?;
//!
//! assert_eq!(engine.submit(1).await?, 11);
//! # Ok(())
//! # }
//! ```

mod config;
mod distribution;
mod engine;
mod group;
mod metrics;
mod outcome;

pub use config::{BatchingConfig, ENV_CAPACITY, ENV_TIMEOUT_MS};
pub use distribution::{Broadcast, DistributionStrategy, FnStrategy, Unpack};
pub use engine::{CoalescingEngine, DownstreamFn};
pub use group::{AcceptResult, Group};
pub use metrics::{BatchingMetrics, MetricsSnapshot, SealReason};
pub use outcome::{GroupId, GroupOutcome, GroupResult, RunSummary};
