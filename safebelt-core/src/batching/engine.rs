//! Coalescing engine.
//!
//! The engine owns exactly one *open* group at a time. Every `submit` call
//! takes the engine lock, appends its item to the open group and remembers its
//! index. The call that fills the group seals it and installs a fresh one, all
//! under the same lock, so no item can land in a sealed group.
//!
//! The first caller of a group (index 0) is its executor: it starts a seal
//! timer and launches the downstream run. The timer re-checks, under the lock,
//! that the group it was started for is still the open one before sealing it.
//! A timer left over from an earlier group therefore never closes a later,
//! unrelated group.
//!
//! Downstream execution and result waiting happen outside the lock, so a new
//! group fills up while the previous one is still executing.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::BatchingConfig;
use super::distribution::{Broadcast, DistributionStrategy, Unpack};
use super::group::{AcceptResult, Group};
use super::metrics::{BatchingMetrics, SealReason};
use super::outcome::{GroupId, GroupOutcome};
use crate::error::{BatchError, ConfigError};
use crate::metrics::prometheus;

/// Downstream operation invoked once per sealed group
pub type DownstreamFn<I, R, E> =
    Arc<dyn Fn(Vec<I>) -> BoxFuture<'static, Result<R, E>> + Send + Sync>;

/// The open group and the outcome its callers will wait on
struct OpenGroup<I, R, E> {
    group: Group<I>,
    outcome: Arc<GroupOutcome<I, R, E>>,
}

impl<I, R, E> OpenGroup<I, R, E> {
    fn new(id: GroupId, capacity: usize) -> Self {
        Self {
            group: Group::bounded(capacity),
            outcome: Arc::new(GroupOutcome::new(id)),
        }
    }
}

struct EngineState<I, R, E> {
    current: OpenGroup<I, R, E>,
    next_id: u64,
}

/// State shared with seal timers
struct Shared<I, R, E> {
    state: Mutex<EngineState<I, R, E>>,
    config: BatchingConfig,
    metrics: Arc<BatchingMetrics>,
}

impl<I, R, E> Shared<I, R, E> {
    /// Seal the open group and install a fresh one; caller holds the lock
    fn seal_current(&self, state: &mut EngineState<I, R, E>, reason: SealReason) {
        let fresh = OpenGroup::new(GroupId(state.next_id), self.config.capacity);
        state.next_id += 1;

        let sealed = std::mem::replace(&mut state.current, fresh);
        let group_id = sealed.outcome.id();
        let size = sealed.group.len();
        sealed.outcome.close(sealed.group);

        self.metrics.record_sealed(reason);
        prometheus::record_group_sealed(reason.as_str());
        tracing::debug!(group_id = %group_id, size, reason = %reason, "Group sealed");
    }

    /// Seal the group `id` if it is still the open one
    async fn seal_if_current(&self, id: GroupId) -> bool {
        let mut state = self.state.lock().await;

        if state.current.outcome.id() != id {
            self.metrics.record_stale_timer();
            tracing::trace!(group_id = %id, "Seal timer fired after group moved on");
            return false;
        }

        self.seal_current(&mut state, SealReason::Timeout);
        true
    }
}

/// Groups concurrently submitted items and runs one downstream call per group
///
/// `I` is the item type, `R` the aggregate the downstream operation returns,
/// `E` its error type and `S` the strategy projecting `R` onto each caller.
pub struct CoalescingEngine<I, R, E, S = Unpack> {
    shared: Arc<Shared<I, R, E>>,
    operation: DownstreamFn<I, R, E>,
    strategy: S,
}

impl<I, R, E, S> CoalescingEngine<I, R, E, S>
where
    I: Send + 'static,
    R: Send + Sync + 'static,
    E: Send + Sync + 'static,
    S: DistributionStrategy<R>,
{
    /// Create an engine from explicit timeout and capacity
    pub fn new<F, Fut>(
        operation: F,
        timeout: Duration,
        capacity: usize,
        strategy: S,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        Self::with_config(operation, BatchingConfig::new(capacity, timeout), strategy)
    }

    /// Create an engine from a [`BatchingConfig`]
    pub fn with_config<F, Fut>(
        operation: F,
        config: BatchingConfig,
        strategy: S,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        config.validate()?;

        let operation: DownstreamFn<I, R, E> = Arc::new(move |items| operation(items).boxed());
        let state = EngineState {
            current: OpenGroup::new(GroupId(0), config.capacity),
            next_id: 1,
        };

        tracing::debug!(
            capacity = config.capacity,
            timeout_ms = config.timeout.as_millis() as u64,
            "Coalescing engine created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                config,
                metrics: Arc::new(BatchingMetrics::new()),
            }),
            operation,
            strategy,
        })
    }

    /// Submit one item and wait for its share of the group result
    pub async fn submit(&self, item: I) -> Result<S::Output, BatchError<E>> {
        let (outcome, index) = self.enqueue(item).await?;
        let result = outcome.await_result(index, &self.strategy).await;
        self.record_result(&result);
        result
    }

    /// Like [`submit`](Self::submit), but gives up when `cancel` fires
    ///
    /// Cancellation only affects this caller. Once accepted, the item stays in
    /// its group and the group still executes for everyone else.
    pub async fn submit_with_cancel(
        &self,
        item: I,
        cancel: &CancellationToken,
    ) -> Result<S::Output, BatchError<E>> {
        let (outcome, index) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Not accepted yet, nothing was assigned to a group
                self.record_result::<S::Output>(&Err(BatchError::Cancelled));
                return Err(BatchError::Cancelled);
            }
            enqueued = self.enqueue(item) => enqueued?,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BatchError::Cancelled),
            result = outcome.await_result(index, &self.strategy) => result,
        };
        self.record_result(&result);
        result
    }

    /// Engine configuration
    pub fn config(&self) -> &BatchingConfig {
        &self.shared.config
    }

    /// Per-engine counters
    pub fn metrics(&self) -> Arc<BatchingMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Number of items waiting in the open group
    pub async fn pending(&self) -> usize {
        self.shared.state.lock().await.current.group.len()
    }

    /// Assign `item` to the open group, sealing it when it fills up
    async fn enqueue(
        &self,
        item: I,
    ) -> Result<(Arc<GroupOutcome<I, R, E>>, usize), BatchError<E>> {
        let capacity = self.shared.config.capacity;
        self.shared.metrics.record_submitted();

        let mut state = self.shared.state.lock().await;

        if state.current.group.is_sealed() {
            if state.current.group.is_empty() {
                return Err(self.reject(capacity));
            }
            // Full groups are rotated by the call that fills them
            tracing::warn!(
                group_id = %state.current.outcome.id(),
                "Open group was full before accepting; rotating"
            );
            self.shared.seal_current(&mut state, SealReason::Capacity);
        }

        let index = state.current.group.next_index();
        let outcome = Arc::clone(&state.current.outcome);

        match state.current.group.accept(item) {
            AcceptResult::Accepted => {}
            AcceptResult::LastAccepted => {
                self.shared.seal_current(&mut state, SealReason::Capacity);
            }
            AcceptResult::Rejected => return Err(self.reject(capacity)),
        }
        drop(state);

        tracing::trace!(group_id = %outcome.id(), index, "Item accepted");

        if index == 0 {
            self.launch(Arc::clone(&outcome));
        }

        Ok((outcome, index))
    }

    /// Start the seal timer and the downstream run for a new group
    fn launch(&self, outcome: Arc<GroupOutcome<I, R, E>>) {
        let timer = self.spawn_seal_timer(outcome.id());
        let operation = Arc::clone(&self.operation);
        let metrics = Arc::clone(&self.shared.metrics);

        tokio::spawn(async move {
            // Counters are updated before the result is published to waiters
            let invoke = move |items: Vec<I>| {
                let size = items.len();
                let started = Instant::now();
                let call = operation(items);
                async move {
                    let result = call.await;
                    let elapsed = started.elapsed();
                    metrics.record_downstream(size, elapsed, result.is_ok());
                    prometheus::record_downstream(size, elapsed, result.is_ok());
                    result
                }
            };

            if let Some(summary) = outcome.run(invoke).await {
                if summary.succeeded {
                    tracing::debug!(
                        group_id = %outcome.id(),
                        size = summary.size,
                        elapsed_ms = summary.elapsed.as_millis() as u64,
                        "Group executed"
                    );
                } else {
                    tracing::warn!(
                        group_id = %outcome.id(),
                        size = summary.size,
                        "Downstream operation failed for group"
                    );
                }
            }
            // No-op if the timer already fired
            timer.abort();
        });
    }

    fn spawn_seal_timer(&self, id: GroupId) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let timeout = shared.config.timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            shared.seal_if_current(id).await;
        })
    }

    fn reject(&self, capacity: usize) -> BatchError<E> {
        self.shared.metrics.record_rejected();
        prometheus::record_submission("rejected");
        tracing::warn!(capacity, "Item rejected by an empty group");
        BatchError::Rejected { capacity }
    }

    fn record_result<T>(&self, result: &Result<T, BatchError<E>>) {
        let status = match result {
            Ok(_) => "ok",
            Err(BatchError::Downstream(_)) => "failed",
            Err(BatchError::MissingResult { .. }) => "missing",
            Err(BatchError::Rejected { .. }) => "rejected",
            Err(BatchError::Cancelled) => {
                self.shared.metrics.record_cancelled();
                "cancelled"
            }
        };
        prometheus::record_submission(status);
    }
}

impl<I, T, E> CoalescingEngine<I, Vec<T>, E, Unpack>
where
    I: Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Engine whose downstream operation returns one value per item, in order
    pub fn unpacking<F, Fut>(operation: F, config: BatchingConfig) -> Result<Self, ConfigError>
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, E>> + Send + 'static,
    {
        Self::with_config(operation, config, Unpack)
    }
}

impl<I, R, E> CoalescingEngine<I, R, E, Broadcast>
where
    I: Send + 'static,
    R: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Engine handing every caller the whole aggregate result
    pub fn broadcasting<F, Fut>(operation: F, config: BatchingConfig) -> Result<Self, ConfigError>
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        Self::with_config(operation, config, Broadcast)
    }
}
