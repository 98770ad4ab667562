//! Metrics sink.
//!
//! Counters are fire-and-forget: callers never depend on a sink's behaviour,
//! and a sink must never block or fail the caller.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Destination for counters and timings.
pub trait Metrics: Send + Sync + std::fmt::Debug {
    /// Increment the counter `name` by one.
    fn increment(&self, name: &str);

    /// Record how long the operation `name` took.
    fn timing(&self, name: &str, elapsed: Duration);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn increment(&self, _name: &str) {}

    fn timing(&self, _name: &str, _elapsed: Duration) {}
}

/// Emits each metric as a `debug` tracing event (`metric = name`).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn increment(&self, name: &str) {
        ::tracing::debug!(metric = name, "counter");
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        ::tracing::debug!(
            metric = name,
            elapsed_ms = elapsed.as_millis() as u64,
            "timing"
        );
    }
}

/// Keeps counters in memory. Intended for tests/dev.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    counters: Mutex<HashMap<String, u64>>,
    timings: Mutex<HashMap<String, Vec<Duration>>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of the counter `name` (zero if never incremented).
    pub fn count(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of timings recorded under `name`.
    pub fn timing_count(&self, name: &str) -> usize {
        self.timings
            .lock()
            .map(|t| t.get(name).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl Metrics for RecordingMetrics {
    fn increment(&self, name: &str) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        if let Ok(mut timings) = self.timings.lock() {
            timings.entry(name.to_string()).or_default().push(elapsed);
        }
    }
}
