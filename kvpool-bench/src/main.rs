//! # Pool Benchmark Harness
//!
//! Purpose: Drive a live key-value server through the pooled connection
//! factory so acquire/command throughput and pool behaviour can be compared
//! across pool settings.
//!
//! ## Design Principles
//! 1. **Explicit Startup Order**: Resources, factory and latency subscriber are
//!    built in the same order an application would use.
//! 2. **Allocation Control**: Keys and the value are pre-built per worker to
//!    keep setup costs off the hot path.
//! 3. **Ordered Teardown**: Subscriber, then factory, then resources.
//!
//! Usage: `kvpool-bench [threads] [ops_per_thread] [value_size]`. Settings are
//! read from the TOML file named by `KVPOOL_CONFIG`, defaulting to a local server.

use std::env;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use kvpool_client::{ClientSettings, ConnectionFactory, LatencyEventSubscriber, LogSink};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_THREADS: usize = 4;
const DEFAULT_OPS_PER_THREAD: usize = 10_000;
const DEFAULT_VALUE_SIZE: usize = 128;
const CONFIG_ENV: &str = "KVPOOL_CONFIG";

struct BenchConfig {
    threads: usize,
    ops_per_thread: usize,
    value_size: usize,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        BenchConfig {
            threads: parse_usize(args.next(), DEFAULT_THREADS).max(1),
            ops_per_thread: parse_usize(args.next(), DEFAULT_OPS_PER_THREAD),
            value_size: parse_usize(args.next(), DEFAULT_VALUE_SIZE),
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn load_settings() -> Result<ClientSettings> {
    match env::var(CONFIG_ENV) {
        Ok(path) => ClientSettings::load(&path).with_context(|| format!("loading settings from {path}")),
        Err(_) => ClientSettings::parse_toml("").context("building default settings"),
    }
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops.max(1) as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.1} us/op)");
}

fn run_worker(factory: &ConnectionFactory, worker: usize, config: &BenchConfig) -> Result<()> {
    let value = vec![b'x'; config.value_size];
    let keys: Vec<Vec<u8>> = (0..config.ops_per_thread)
        .map(|i| format!("bench:{worker}:{i}").into_bytes())
        .collect();

    for key in &keys {
        // One acquire per operation exercises pool turnover, not just the socket.
        let mut conn = factory.acquire()?;
        conn.set(key, &value)?;
        conn.get(key)?;
        conn.close();
    }
    Ok(())
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = BenchConfig::from_args();
    let settings = load_settings()?;

    let resources = settings.build_resources()?;
    let factory = Arc::new(settings.build_factory(&resources)?);
    let subscription = LatencyEventSubscriber::attach(&resources, LogSink)?;

    let prepared = factory.prepare()?;
    info!(
        address = %factory.endpoint().address(),
        threads = config.threads,
        ops_per_thread = config.ops_per_thread,
        prepared,
        "starting benchmark"
    );

    let config = Arc::new(config);
    let start = Instant::now();
    let workers: Vec<_> = (0..config.threads)
        .map(|worker| {
            let factory = factory.clone();
            let config = config.clone();
            thread::spawn(move || run_worker(&factory, worker, &config))
        })
        .collect();
    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("benchmark worker panicked"))??;
    }
    // Each op is a SET plus a GET.
    report("set+get", config.threads * config.ops_per_thread * 2, start.elapsed());

    let stats = factory.stats();
    println!(
        "{}",
        serde_json::json!({
            "created": stats.created,
            "destroyed": stats.destroyed,
            "borrowed": stats.borrowed,
            "returned": stats.returned,
            "exhausted": stats.exhausted,
            "idle": stats.idle,
        })
    );

    subscription.detach();
    factory.close();
    resources.shutdown(Duration::from_secs(2));
    Ok(())
}
