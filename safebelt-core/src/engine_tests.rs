// Tests for the coalescing engine and its collaborators

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::future::join_all;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::batching::{BatchingConfig, CoalescingEngine, FnStrategy};
    use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    use crate::error::{BatchError, CircuitError};
    use crate::retry::{self, RetryPolicy};

    #[derive(Debug, PartialEq, thiserror::Error)]
    #[error("dummy downstream failure")]
    struct DummyError;

    /// Records the items of every downstream call
    #[derive(Clone, Default)]
    struct CallLog {
        calls: Arc<Mutex<Vec<Vec<u32>>>>,
    }

    impl CallLog {
        fn record(&self, items: &[u32]) {
            self.calls.lock().unwrap().push(items.to_vec());
        }

        fn sizes(&self) -> Vec<usize> {
            self.calls.lock().unwrap().iter().map(Vec::len).collect()
        }

        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    /// Engine adding 10 to every item
    fn plus_ten(
        log: &CallLog,
        config: BatchingConfig,
    ) -> CoalescingEngine<u32, Vec<u32>, DummyError> {
        let log = log.clone();
        CoalescingEngine::unpacking(
            move |items: Vec<u32>| {
                log.record(&items);
                async move { Ok(items.iter().map(|x| x + 10).collect()) }
            },
            config,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_grouping() {
        let log = CallLog::default();
        let engine = plus_ten(&log, BatchingConfig::new(4, Duration::from_millis(50)));

        let results = join_all((0..11).map(|x| engine.submit(x))).await;
        assert!(results.iter().all(Result::is_ok));

        let sizes = log.sizes();
        assert_eq!(sizes.len(), 3, "11 items at capacity 4 make 3 groups");
        assert_eq!(sizes.iter().sum::<usize>(), 11);
        assert!(sizes.iter().all(|&size| size <= 4));

        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.groups_sealed_capacity, 2);
        assert_eq!(snapshot.groups_sealed_timeout, 1);
        assert_eq!(snapshot.max_group_size, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_fidelity() {
        let log = CallLog::default();
        let engine = plus_ten(&log, BatchingConfig::new(4, Duration::from_millis(50)));

        let values: Vec<u32> = (0..11).map(|x| x * 7).collect();
        let results = join_all(values.iter().map(|&v| engine.submit(v))).await;

        for (value, result) in values.iter().zip(results) {
            assert_eq!(result.unwrap(), value + 10);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_execution_per_group() {
        let log = CallLog::default();
        let engine = plus_ten(&log, BatchingConfig::new(3, Duration::from_millis(20)));

        for round in 0..4u32 {
            let items = (0..5).map(|i| round * 100 + i);
            join_all(items.map(|x| engine.submit(x))).await;
        }

        let metrics = engine.metrics();
        assert_eq!(log.count() as u64, metrics.groups_sealed());
        assert_eq!(metrics.downstream_calls(), metrics.groups_sealed());
        assert_eq!(log.count(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_sealing() {
        let called_at = Arc::new(Mutex::new(None));
        let log = CallLog::default();
        let engine = {
            let called_at = called_at.clone();
            let log = log.clone();
            CoalescingEngine::unpacking(
                move |items: Vec<u32>| {
                    *called_at.lock().unwrap() = Some(Instant::now());
                    log.record(&items);
                    async move { Ok::<_, DummyError>(items) }
                },
                BatchingConfig::new(100, Duration::from_millis(50)),
            )
            .unwrap()
        };

        let started = Instant::now();
        let (a, b, c) = tokio::join!(engine.submit(1), engine.submit(2), engine.submit(3));
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 2, 3));

        assert_eq!(*log.calls.lock().unwrap(), vec![vec![1, 2, 3]]);
        let called_at = (*called_at.lock().unwrap()).expect("downstream was called");
        assert!(called_at - started >= Duration::from_millis(50));
        assert_eq!(engine.metrics().snapshot().groups_sealed_timeout, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_group_does_not_wait_for_timer() {
        let log = CallLog::default();
        let engine = plus_ten(&log, BatchingConfig::new(2, Duration::from_secs(10)));

        let started = Instant::now();
        let (a, b) = tokio::join!(engine.submit(1), engine.submit(2));
        assert_eq!((a.unwrap(), b.unwrap()), (11, 12));
        assert!(started.elapsed() < Duration::from_secs(1));

        // Past the first deadline: no second call, no stray seal
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(log.count(), 1);
        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.groups_sealed_timeout, 0);
        assert_eq!(engine.pending().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_fan_out() {
        let engine = CoalescingEngine::unpacking(
            |_items: Vec<u32>| async move { Err::<Vec<u32>, _>(DummyError) },
            BatchingConfig::new(3, Duration::from_millis(50)),
        )
        .unwrap();

        let results = join_all((0..3).map(|x| engine.submit(x))).await;

        let errors: Vec<_> = results.into_iter().map(Result::unwrap_err).collect();
        for err in &errors {
            assert_eq!(err.downstream(), Some(&DummyError));
            assert_eq!(err.to_string(), "Downstream operation failed: dummy downstream failure");
        }

        // One failure value shared by every waiter
        match (&errors[0], &errors[2]) {
            (BatchError::Downstream(first), BatchError::Downstream(last)) => {
                assert!(Arc::ptr_eq(first, last));
            }
            other => panic!("unexpected errors: {:?}", other),
        }

        assert_eq!(engine.metrics().snapshot().downstream_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_one() {
        let log = CallLog::default();
        let engine = plus_ten(&log, BatchingConfig::new(1, Duration::from_secs(10)));

        for x in 0..5 {
            assert_eq!(engine.submit(x).await.unwrap(), x + 10);
        }

        assert_eq!(log.sizes(), vec![1; 5]);
        assert_eq!(engine.metrics().snapshot().groups_sealed_capacity, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_seal_later_group() {
        let engine = Arc::new(
            CoalescingEngine::unpacking(
                |items: Vec<u32>| async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, DummyError>(items)
                },
                BatchingConfig::new(2, Duration::from_millis(100)),
            )
            .unwrap(),
        );

        // Group 0 fills at t=0 and executes until t=200; its timer fires at t=100
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { tokio::join!(engine.submit(1), engine.submit(2)) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Group 1 opens at t=50, its own timer is due at t=150
        let late = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.submit(3).await })
        };
        tokio::time::sleep(Duration::from_millis(70)).await;

        assert_eq!(engine.pending().await, 1, "late group must still be open at t=120");
        assert_eq!(engine.metrics().snapshot().stale_timers, 1);

        let (a, b) = first.await.unwrap();
        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert_eq!(late.await.unwrap().unwrap(), 3);

        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.groups_sealed_capacity, 1);
        assert_eq!(snapshot.groups_sealed_timeout, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_affect_others() {
        let log = CallLog::default();
        let engine = plus_ten(&log, BatchingConfig::new(4, Duration::from_millis(100)));
        let token = CancellationToken::new();

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        };

        // The cancelled caller is the group's first item
        let (a, b, c, ()) = tokio::join!(
            engine.submit_with_cancel(1, &token),
            engine.submit(2),
            engine.submit(3),
            canceller,
        );

        assert!(a.unwrap_err().is_cancelled());
        assert_eq!((b.unwrap(), c.unwrap()), (12, 13));

        // The cancelled item stays in its group
        assert_eq!(*log.calls.lock().unwrap(), vec![vec![1, 2, 3]]);
        assert_eq!(engine.metrics().snapshot().waiters_cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_submit() {
        let log = CallLog::default();
        let engine = plus_ten(&log, BatchingConfig::new(4, Duration::from_millis(10)));
        let token = CancellationToken::new();
        token.cancel();

        let result = engine.submit_with_cancel(1, &token).await;
        assert!(matches!(result, Err(BatchError::Cancelled)));
        assert_eq!(engine.pending().await, 0);
        assert_eq!(log.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_downstream_cancels_waiters() {
        let engine = CoalescingEngine::unpacking(
            |_items: Vec<u32>| async move {
                if true {
                    panic!("downstream exploded");
                }
                Ok::<Vec<u32>, DummyError>(Vec::new())
            },
            BatchingConfig::new(2, Duration::from_millis(10)),
        )
        .unwrap();

        let (a, b) = tokio::join!(engine.submit(1), engine.submit(2));
        assert!(matches!(a, Err(BatchError::Cancelled)));
        assert!(matches!(b, Err(BatchError::Cancelled)));
        assert_eq!(engine.metrics().snapshot().waiters_cancelled, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_result_is_missing() {
        let engine = CoalescingEngine::unpacking(
            |items: Vec<u32>| async move { Ok::<_, DummyError>(items[..1].to_vec()) },
            BatchingConfig::new(2, Duration::from_millis(10)),
        )
        .unwrap();

        let (a, b) = tokio::join!(engine.submit(5), engine.submit(6));
        assert_eq!(a.unwrap(), 5);
        assert!(matches!(
            b,
            Err(BatchError::MissingResult {
                index: 1,
                group_size: 2
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_distribution() {
        // Each caller receives its own item and the group total
        let strategy: FnStrategy<_, (u32, u32)> = FnStrategy::new(|values: &Vec<u32>, index: usize| {
            let total: u32 = values.iter().sum();
            values.get(index).map(|v| (*v, total))
        });
        let engine = CoalescingEngine::with_config(
            |items: Vec<u32>| async move { Ok::<_, DummyError>(items) },
            BatchingConfig::new(3, Duration::from_millis(10)),
            strategy,
        )
        .unwrap();

        let results = join_all([1, 2, 3].map(|x| engine.submit(x))).await;
        let results: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(results, vec![(1, 6), (2, 6), (3, 6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_wrapped_downstream() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let flaky = {
            let attempts = attempts.clone();
            move |items: Vec<u32>| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(DummyError)
                    } else {
                        Ok(items.iter().map(|x| x * 2).collect::<Vec<u32>>())
                    }
                }
            }
        };

        let policy = RetryPolicy::with_exponential_backoff(
            3,
            Duration::from_millis(5),
            Duration::from_millis(50),
        )
        .unwrap();
        let engine = CoalescingEngine::unpacking(
            retry::wrap(flaky, policy),
            BatchingConfig::new(3, Duration::from_millis(10)),
        )
        .unwrap();

        let results = join_all([1, 2, 3].map(|x| engine.submit(x))).await;
        let results: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(results, vec![2, 4, 6]);

        // The engine sees one call; the retry layer made two
        assert_eq!(engine.metrics().downstream_calls(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_guarded_downstream() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            name: "engine-test".to_string(),
            failure_ratio_threshold: 0.5,
            minimum_requests: 2,
            buckets_count: 4,
            bucket_interval: Duration::from_secs(1),
            open_interval: Duration::from_secs(30),
        })
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let failing = {
            let calls = calls.clone();
            move |_items: Vec<u32>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<Vec<u32>, _>(DummyError) }
            }
        };
        let engine = CoalescingEngine::unpacking(
            breaker.guarded(failing),
            BatchingConfig::new(1, Duration::from_millis(10)),
        )
        .unwrap();

        for x in 0..2 {
            let err = engine.submit(x).await.unwrap_err();
            assert!(matches!(err.downstream(), Some(CircuitError::Inner(DummyError))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = engine.submit(2).await.unwrap_err();
        assert!(err.downstream().is_some_and(CircuitError::is_open));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_parallel_submits_land_in_exactly_one_group() {
        const ITEMS: u32 = 5000;
        const CAPACITY: usize = 7;

        let log = CallLog::default();
        let engine = Arc::new(plus_ten(
            &log,
            BatchingConfig::new(CAPACITY, Duration::from_millis(2)),
        ));

        let handles: Vec<_> = (0..ITEMS)
            .map(|x| {
                let engine = engine.clone();
                tokio::spawn(async move { (x, engine.submit(x).await) })
            })
            .collect();

        for handle in join_all(handles).await {
            let (x, result) = handle.unwrap();
            assert_eq!(result.unwrap(), x + 10);
        }

        let calls = log.calls.lock().unwrap().clone();
        assert!(calls.iter().all(|items| (1..=CAPACITY).contains(&items.len())));

        let mut seen: Vec<u32> = calls.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..ITEMS).collect::<Vec<_>>());

        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.items_submitted, u64::from(ITEMS));
        assert!(snapshot.max_group_size <= CAPACITY as u64);
    }
}
