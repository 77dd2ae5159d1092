use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safebelt_core::batching::{BatchingConfig, CoalescingEngine};
use safebelt_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use safebelt_core::error::{BatchError, CircuitError};
use safebelt_core::metrics;
use safebelt_core::retry::{
    self, BackoffStrategy, ExponentialBackoff, JitterBackoff, RetryConfig,
};
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Downstream operation shape shared by every simulation layer
type SimulatedOp = Arc<dyn Fn(Vec<u64>) -> BoxFuture<'static, anyhow::Result<Vec<u64>>> + Send + Sync>;

#[derive(Parser)]
#[command(name = "safebelt")]
#[command(version = "0.1.0")]
#[command(about = "Safebelt - request coalescing with retry and circuit breaking", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Coalesce a handful of concurrent callers and show each group
    Demo {
        /// Number of concurrent callers
        #[arg(short, long, default_value_t = 11)]
        items: u64,

        /// Maximum group size
        #[arg(short, long, default_value_t = 4)]
        capacity: usize,

        /// Seal timeout in milliseconds
        #[arg(short, long, default_value_t = 50)]
        timeout_ms: u64,
    },

    /// Drive the engine with simulated load and print its metrics as JSON
    Simulate {
        /// Number of submitted items
        #[arg(short, long, default_value_t = 1000)]
        items: u64,

        /// Maximum group size (defaults to SAFEBELT_BATCH_CAPACITY or 32)
        #[arg(short, long)]
        capacity: Option<usize>,

        /// Seal timeout in milliseconds (defaults to SAFEBELT_BATCH_TIMEOUT_MS or 50)
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Items arrive uniformly spread over this many milliseconds
        #[arg(long, default_value_t = 200)]
        spread_ms: u64,

        /// Simulated downstream latency in milliseconds
        #[arg(long, default_value_t = 10)]
        latency_ms: u64,

        /// Probability that a downstream call fails
        #[arg(long, default_value_t = 0.0)]
        failure_rate: f64,

        /// Downstream attempts per group; 1 disables retrying
        #[arg(long, default_value_t = 1)]
        retry_attempts: u32,

        /// Guard the downstream operation with a circuit breaker
        #[arg(long)]
        breaker: bool,

        /// Seed for arrivals and failure injection
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Also print the Prometheus exposition text
        #[arg(long)]
        prometheus: bool,
    },

    /// Print the delay schedule of a backoff strategy
    Backoff {
        /// Backoff kind
        #[arg(short, long, value_enum, default_value_t = BackoffKind::Jitter)]
        kind: BackoffKind,

        /// Base delay in milliseconds
        #[arg(short, long, default_value_t = 100)]
        base_ms: u64,

        /// Maximum delay in milliseconds
        #[arg(short, long, default_value_t = 10_000)]
        max_ms: u64,

        /// Number of attempts to show
        #[arg(short, long, default_value_t = 8)]
        attempts: u32,

        /// Seed for jitter (random when omitted)
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show the effective configuration resolved from the environment
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackoffKind {
    Exponential,
    Jitter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("safebelt=info,safebelt_core=info"));

    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            items,
            capacity,
            timeout_ms,
        } => run_demo(items, capacity, timeout_ms).await?,

        Commands::Simulate {
            items,
            capacity,
            timeout_ms,
            spread_ms,
            latency_ms,
            failure_rate,
            retry_attempts,
            breaker,
            seed,
            prometheus,
        } => {
            if !(0.0..=1.0).contains(&failure_rate) {
                anyhow::bail!("--failure-rate must be between 0 and 1, got {}", failure_rate);
            }

            let mut config = BatchingConfig::from_env().context("Invalid batching environment")?;
            if let Some(capacity) = capacity {
                config.capacity = capacity;
            }
            if let Some(ms) = timeout_ms {
                config.timeout = Duration::from_millis(ms);
            }

            let sim = Simulation {
                items,
                config,
                spread: Duration::from_millis(spread_ms),
                latency: Duration::from_millis(latency_ms),
                failure_rate,
                retry_attempts,
                breaker,
                seed,
            };

            if prometheus {
                metrics::register_metrics().context("Failed to register Prometheus metrics")?;
            }

            let report = sim.run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if prometheus {
                println!("=== Prometheus ===");
                print!("{}", metrics::encode_metrics());
            }
        }

        Commands::Backoff {
            kind,
            base_ms,
            max_ms,
            attempts,
            seed,
        } => {
            let base = Duration::from_millis(base_ms);
            let cap = Duration::from_millis(max_ms);

            let strategy: Box<dyn BackoffStrategy> = match (kind, seed) {
                (BackoffKind::Exponential, _) => Box::new(ExponentialBackoff::capped(base, cap)?),
                (BackoffKind::Jitter, Some(seed)) => Box::new(JitterBackoff::with_source(
                    StdRng::seed_from_u64(seed),
                    base,
                    cap,
                )?),
                (BackoffKind::Jitter, None) => Box::new(JitterBackoff::capped(base, cap)?),
            };

            println!("=== Backoff schedule ===");
            for attempt in 0..attempts {
                let delay = strategy.delay(attempt);
                println!("Attempt #{}: {} ms", attempt, delay.as_millis());
            }
        }

        Commands::Config => {
            let batching = BatchingConfig::from_env().context("Invalid batching environment")?;
            let retry = RetryConfig::from_env().context("Invalid retry environment")?;
            let breaker =
                CircuitBreakerConfig::from_env().context("Invalid circuit breaker environment")?;

            let config = json!({
                "batching": {
                    "capacity": batching.capacity,
                    "timeout_ms": batching.timeout.as_millis() as u64,
                },
                "retry": {
                    "attempts": retry.attempts,
                    "base_delay_ms": retry.base_delay.as_millis() as u64,
                    "max_delay_ms": retry.max_delay.as_millis() as u64,
                    "jitter": retry.jitter,
                },
                "breaker": {
                    "failure_ratio_threshold": breaker.failure_ratio_threshold,
                    "minimum_requests": breaker.minimum_requests,
                    "open_interval_ms": breaker.open_interval.as_millis() as u64,
                },
            });
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run_demo(items: u64, capacity: usize, timeout_ms: u64) -> anyhow::Result<()> {
    println!("Coalescing {} callers, capacity {}, timeout {} ms\n", items, capacity, timeout_ms);

    let calls = Arc::new(Mutex::new(0usize));
    let engine = {
        let calls = Arc::clone(&calls);
        CoalescingEngine::unpacking(
            move |group: Vec<u64>| {
                let call = {
                    let mut calls = calls.lock().unwrap_or_else(|p| p.into_inner());
                    *calls += 1;
                    *calls
                };
                println!("Downstream call #{} with {} items: {:?}", call, group.len(), group);
                async move { Ok::<_, std::io::Error>(group.iter().map(|x| x + 10).collect()) }
            },
            BatchingConfig::new(capacity, Duration::from_millis(timeout_ms)),
        )
        .context("Invalid demo configuration")?
    };

    let results = join_all((0..items).map(|x| engine.submit(x))).await;

    println!("\n=== Results ===");
    for (item, result) in results.iter().enumerate() {
        match result {
            Ok(value) => println!("submit({}) -> {}", item, value),
            Err(e) => println!("submit({}) failed: {}", item, e),
        }
    }

    let snapshot = engine.metrics().snapshot();
    println!(
        "\n{} downstream calls, average group size {:.1}",
        snapshot.downstream_calls, snapshot.avg_group_size
    );

    Ok(())
}

/// Marks group failures caused by an open circuit
#[derive(Debug)]
struct CircuitOpen;

impl std::fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("circuit open")
    }
}

impl std::error::Error for CircuitOpen {}

/// Load simulation settings
struct Simulation {
    items: u64,
    config: BatchingConfig,
    spread: Duration,
    latency: Duration,
    failure_rate: f64,
    retry_attempts: u32,
    breaker: bool,
    seed: u64,
}

#[derive(Default, serde::Serialize)]
struct Outcomes {
    ok: u64,
    failed: u64,
    breaker_open: u64,
    rejected: u64,
    missing: u64,
    cancelled: u64,
}

impl Simulation {
    /// Downstream stand-in that sleeps and fails at random
    fn downstream(&self) -> SimulatedOp {
        let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(self.seed)));
        let latency = self.latency;
        let failure_rate = self.failure_rate;

        Arc::new(move |items: Vec<u64>| {
            let fail = rng
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .gen_bool(failure_rate);
            async move {
                tokio::time::sleep(latency).await;
                if fail {
                    anyhow::bail!("simulated downstream failure for {} items", items.len());
                }
                Ok(items)
            }
            .boxed()
        })
    }

    async fn run(self) -> anyhow::Result<serde_json::Value> {
        let mut operation = self.downstream();

        if self.retry_attempts > 1 {
            let policy = RetryConfig {
                attempts: self.retry_attempts,
                ..RetryConfig::from_env().context("Invalid retry environment")?
            }
            .build()?;
            let inner = operation;
            let wrapped = retry::wrap(move |items: Vec<u64>| inner(items), policy);
            operation = Arc::new(wrapped);
        }

        let breaker = if self.breaker {
            let breaker = CircuitBreaker::new(
                CircuitBreakerConfig::from_env().context("Invalid circuit breaker environment")?,
            )?;
            let inner = operation;
            let guarded = breaker.guarded(move |items: Vec<u64>| inner(items));
            operation = Arc::new(move |items: Vec<u64>| {
                guarded(items)
                    .map(|result| {
                        result.map_err(|e| match e {
                            CircuitError::Open => anyhow::Error::new(CircuitOpen),
                            CircuitError::Inner(e) => e,
                        })
                    })
                    .boxed()
            });
            Some(breaker)
        } else {
            None
        };

        let engine = Arc::new(CoalescingEngine::unpacking(
            move |items: Vec<u64>| operation(items),
            self.config.clone(),
        )?);

        tracing::info!(
            items = self.items,
            capacity = self.config.capacity,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Starting simulation"
        );

        let mut arrivals = StdRng::seed_from_u64(self.seed.wrapping_add(1));
        let spread_ms = self.spread.as_millis() as u64;
        let started = Instant::now();

        let handles: Vec<_> = (0..self.items)
            .map(|item| {
                let engine = Arc::clone(&engine);
                let delay = Duration::from_millis(arrivals.gen_range(0..=spread_ms));
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    engine.submit(item).await
                })
            })
            .collect();

        let mut outcomes = Outcomes::default();
        for handle in handles {
            match handle.await.context("Submit task panicked")? {
                Ok(_) => outcomes.ok += 1,
                Err(BatchError::Downstream(e)) if e.is::<CircuitOpen>() => {
                    outcomes.breaker_open += 1
                }
                Err(BatchError::Downstream(_)) => outcomes.failed += 1,
                Err(BatchError::Rejected { .. }) => outcomes.rejected += 1,
                Err(BatchError::MissingResult { .. }) => outcomes.missing += 1,
                Err(BatchError::Cancelled) => outcomes.cancelled += 1,
            }
        }
        let elapsed = started.elapsed();

        tracing::info!(
            elapsed_ms = elapsed.as_millis() as u64,
            ok = outcomes.ok,
            "Simulation finished"
        );

        Ok(json!({
            "items": self.items,
            "capacity": self.config.capacity,
            "timeout_ms": self.config.timeout.as_millis() as u64,
            "elapsed_ms": elapsed.as_millis() as u64,
            "outcomes": outcomes,
            "engine": engine.metrics().snapshot(),
            "breaker": breaker.map(|b| b.metrics()),
        }))
    }
}
