//! Refresh instrumentation.
//!
//! - **Counters**: passes, round trips, downloads, fallbacks, failed groups
//! - **Gauges**: groups live in the current pool
//! - **Latency**: pass duration, mean and max
//!
//! A `RefreshMetrics` is shared by `Arc` with the refresher; export with `to_json`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// =============================================================================
// Metric Types
// =============================================================================

/// Monotonic event count.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Last observed size.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Pass latency: count, mean and worst case.
#[derive(Debug, Default)]
pub struct Latency {
    count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl Latency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean_ms(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.total_micros.load(Ordering::Relaxed) as f64 / 1000.0 / n as f64,
        }
    }

    pub fn max_ms(&self) -> f64 {
        self.max_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

// =============================================================================
// Refresh Metrics Collection
// =============================================================================

#[derive(Debug)]
pub struct RefreshMetrics {
    pub passes_total: Counter,
    pub rounds_total: Counter,
    pub downloads_total: Counter,
    pub download_failures: Counter,
    pub fallbacks_total: Counter,
    pub groups_failed: Counter,

    pub pool_groups: Gauge,

    /// Wall time of one resolution pass, unlocked waits included.
    pub pass_latency: Latency,
}

impl RefreshMetrics {
    pub fn new() -> Self {
        Self {
            passes_total: Counter::new(),
            rounds_total: Counter::new(),
            downloads_total: Counter::new(),
            download_failures: Counter::new(),
            fallbacks_total: Counter::new(),
            groups_failed: Counter::new(),
            pool_groups: Gauge::new(),
            pass_latency: Latency::new(),
        }
    }

    /// Export metrics as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "counters": {
                "passes_total": self.passes_total.get(),
                "rounds_total": self.rounds_total.get(),
                "downloads_total": self.downloads_total.get(),
                "download_failures": self.download_failures.get(),
                "fallbacks_total": self.fallbacks_total.get(),
                "groups_failed": self.groups_failed.get(),
            },
            "gauges": {
                "pool_groups": self.pool_groups.get(),
            },
            "latencies_ms": {
                "pass_mean": self.pass_latency.mean_ms(),
                "pass_max": self.pass_latency.max_ms(),
                "pass_count": self.pass_latency.count(),
            },
        })
    }
}

impl Default for RefreshMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Stage Timer
// =============================================================================

/// Records the time until drop into a `Latency`.
pub struct StageTimer<'a> {
    latency: &'a Latency,
    start: Instant,
}

impl<'a> StageTimer<'a> {
    pub fn start(latency: &'a Latency) -> Self {
        Self {
            latency,
            start: Instant::now(),
        }
    }
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        self.latency.observe(self.start.elapsed());
    }
}
