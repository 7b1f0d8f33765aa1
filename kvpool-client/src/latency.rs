//! # Command Latency Collection
//!
//! Record per-command completion latency on the data path and publish an
//! aggregated `CommandLatencyEvent` once per emit interval.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic bucket counters make recording cheap.
//! 2. **Fixed Buckets**: Histogram buckets live in a contiguous array.
//! 3. **Off the Hot Path**: Aggregation and publishing run on the computation
//!    runtime, never on the caller's thread.
//!
//! ## Notes
//! - Bucket boundaries are in microseconds and sized for network round trips.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

use crate::event::{CommandLatencies, CommandLatencyEvent, EventBus, LatencyStats, RuntimeEvent};

/// Default latency bucket boundaries in microseconds.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 16] = [
    50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000,
    1_000_000, 2_500_000, 5_000_000,
];

/// Fixed-bucket latency histogram.
///
/// Uses a linear scan to pick buckets; the list is short and stays hot in cache.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with explicit bucket boundaries (microseconds).
    ///
    /// **Input**: `bounds_us` sorted ascending.
    /// **Output**: histogram with `bounds_us.len() + 1` buckets (last is overflow).
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    /// Records a latency measurement into the histogram.
    ///
    /// **Logic**:
    /// 1. Convert to microseconds.
    /// 2. Increment `samples`, add to `sum_us`, fold into min/max.
    /// 3. Find the first bucket where `micros <= bound`, otherwise use overflow.
    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);
        self.min_us.fetch_min(micros, Ordering::Relaxed);
        self.max_us.fetch_max(micros, Ordering::Relaxed);

        let idx = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of recorded samples.
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Summarizes the histogram into count, min/max/mean and percentiles.
    ///
    /// Returns `None` when nothing was recorded.
    pub fn stats(&self) -> Option<LatencyStats> {
        let samples = self.samples();
        if samples == 0 {
            return None;
        }
        let counts: Vec<u64> = self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect();
        let min_us = self.min_us.load(Ordering::Relaxed);
        let max_us = self.max_us.load(Ordering::Relaxed);

        Some(LatencyStats {
            count: samples,
            min_us,
            max_us,
            mean_us: self.sum_us.load(Ordering::Relaxed) / samples,
            p50_us: self.percentile(&counts, samples, 50, max_us),
            p90_us: self.percentile(&counts, samples, 90, max_us),
            p99_us: self.percentile(&counts, samples, 99, max_us),
        })
    }

    fn percentile(&self, counts: &[u64], samples: u64, pct: u64, max_us: u64) -> u64 {
        let rank = (samples * pct).div_ceil(100).max(1);
        let mut seen = 0;
        for (idx, count) in counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                // Overflow bucket has no upper bound; the observed max is the best estimate.
                return self.bounds_us.get(idx).map_or(max_us, |&bound| bound.min(max_us));
            }
        }
        max_us
    }
}

/// Per-command latency collector shared by every connection of a resource set.
pub struct CommandLatencyCollector {
    enabled: bool,
    reset_after_emit: bool,
    commands: Mutex<HashMap<String, LatencyHistogram>>,
}

impl CommandLatencyCollector {
    pub fn new(enabled: bool, reset_after_emit: bool) -> Self {
        CommandLatencyCollector {
            enabled,
            reset_after_emit,
            commands: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Records one completed command.
    pub fn record(&self, command: &str, latency: Duration) {
        if !self.enabled {
            return;
        }
        let mut commands = self.commands.lock();
        if let Some(histogram) = commands.get(command) {
            histogram.record(latency);
            return;
        }
        let histogram = LatencyHistogram::new(DEFAULT_LATENCY_BUCKETS_US.to_vec());
        histogram.record(latency);
        commands.insert(command.to_string(), histogram);
    }

    /// Summarizes every command seen since the last reset.
    pub fn snapshot(&self) -> CommandLatencies {
        let mut commands = self.commands.lock();
        let latencies = commands
            .iter()
            .filter_map(|(name, histogram)| histogram.stats().map(|stats| (name.clone(), stats)))
            .collect();
        if self.reset_after_emit {
            commands.clear();
        }
        latencies
    }
}

/// Publishes one `CommandLatencyEvent` per `interval` until the runtime stops.
///
/// The first event fires one full interval after start.
pub(crate) async fn emit_latencies(
    collector: Arc<CommandLatencyCollector>,
    bus: EventBus,
    interval: Duration,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let latencies = collector.snapshot();
        trace!(commands = latencies.len(), "publishing command latency event");
        bus.publish(RuntimeEvent::CommandLatency(CommandLatencyEvent { latencies }));
    }
}
