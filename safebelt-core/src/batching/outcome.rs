//! Shared completion object for one group.
//!
//! A [`GroupOutcome`] carries two one-shot signals:
//!
//! - **ready**: the group's membership is frozen. Closing the outcome hands the
//!   sealed [`Group`] over to whoever runs it.
//! - **done**: the downstream result (or failure) has been published. Any
//!   number of waiters observe the same stored value.
//!
//! Ready travels over a `oneshot` channel since exactly one runner consumes it.
//! Done is a `watch` channel so late subscribers still see the published value.
//! If the runner is dropped before publishing (runtime shutdown, a panicking
//! downstream operation) the watch sender goes away with it and every waiter
//! observes [`BatchError::Cancelled`] instead of hanging.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};

use super::distribution::DistributionStrategy;
use super::group::Group;
use crate::error::BatchError;

/// Identifier of a group, unique per engine and strictly increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub u64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Result published once per group
#[derive(Debug)]
pub struct GroupResult<R, E> {
    /// Number of items the downstream operation received
    pub size: usize,
    /// Aggregate value or failure
    pub result: Result<Arc<R>, Arc<E>>,
}

/// What happened during [`GroupOutcome::run`]
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub size: usize,
    pub succeeded: bool,
    pub elapsed: Duration,
}

type Published<R, E> = Option<Arc<GroupResult<R, E>>>;

/// Multi-waiter completion for one group
pub struct GroupOutcome<I, R, E> {
    id: GroupId,
    ready_tx: Mutex<Option<oneshot::Sender<Group<I>>>>,
    ready_rx: Mutex<Option<oneshot::Receiver<Group<I>>>>,
    done_tx: Mutex<Option<watch::Sender<Published<R, E>>>>,
    done_rx: watch::Receiver<Published<R, E>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The guarded values are plain Options, a poisoned lock is still consistent
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<I, R, E> GroupOutcome<I, R, E> {
    /// Create an outcome with neither signal set
    pub fn new(id: GroupId) -> Self {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(None);
        Self {
            id,
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx: Mutex::new(Some(ready_rx)),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Set the ready signal, handing the frozen group to the runner
    ///
    /// Must be called at most once; a second call is ignored.
    pub fn close(&self, group: Group<I>) {
        match lock(&self.ready_tx).take() {
            Some(tx) => {
                // The runner may already be gone, in which case waiters see Cancelled
                let _ = tx.send(group);
            }
            None => {
                tracing::warn!(group_id = %self.id, "Group outcome closed twice");
            }
        }
    }

    /// Whether the ready signal has been set
    pub fn is_closed(&self) -> bool {
        lock(&self.ready_tx).is_none()
    }

    /// Whether a result or failure has been published
    pub fn is_done(&self) -> bool {
        self.done_rx.borrow().is_some()
    }

    /// Wait for the ready signal, invoke `operation` once with the group's
    /// items and publish what it returns
    ///
    /// Only the first call does anything; later calls return `None`.
    pub async fn run<F, Fut>(&self, operation: F) -> Option<RunSummary>
    where
        F: FnOnce(Vec<I>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let ready_rx = lock(&self.ready_rx).take();
        let done_tx = lock(&self.done_tx).take();
        let (Some(ready_rx), Some(done_tx)) = (ready_rx, done_tx) else {
            tracing::warn!(group_id = %self.id, "Group outcome run more than once");
            return None;
        };

        let group = match ready_rx.await {
            Ok(group) => group,
            Err(_) => {
                // Closer dropped without sealing; dropping done_tx releases the waiters
                tracing::warn!(group_id = %self.id, "Group abandoned before it was sealed");
                return None;
            }
        };

        let size = group.len();
        let started = Instant::now();
        let result = operation(group.into_items()).await;
        let elapsed = started.elapsed();
        let succeeded = result.is_ok();

        done_tx.send_replace(Some(Arc::new(GroupResult {
            size,
            result: result.map(Arc::new).map_err(Arc::new),
        })));

        Some(RunSummary {
            size,
            succeeded,
            elapsed,
        })
    }

    /// Wait for the done signal and project this caller's slice
    pub async fn await_result<S>(&self, index: usize, strategy: &S) -> Result<S::Output, BatchError<E>>
    where
        S: DistributionStrategy<R>,
    {
        let published = self.wait_published().await.ok_or(BatchError::Cancelled)?;

        match &published.result {
            Ok(value) => strategy
                .distribute(value, index)
                .ok_or(BatchError::MissingResult {
                    index,
                    group_size: published.size,
                }),
            Err(err) => Err(BatchError::Downstream(Arc::clone(err))),
        }
    }

    async fn wait_published(&self) -> Option<Arc<GroupResult<R, E>>> {
        let mut rx = self.done_rx.clone();
        let value = rx.wait_for(Option::is_some).await.ok()?;
        value.clone()
    }
}
