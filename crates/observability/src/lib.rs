//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;

/// Fire-and-forget counters and timings.
pub mod metrics;

pub use metrics::{Metrics, NoopMetrics, RecordingMetrics, TracingMetrics};
