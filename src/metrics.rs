//! Metrics for the recovery coordinator.
//!
//! Counter and Gauge types with atomic operations for thread-safe
//! updates, plus the counters the coordinator keeps across recoveries.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter initialized to 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Add a value to the counter.
    pub fn add(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can go up or down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Create a new gauge initialized to 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the gauge by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the gauge by 1.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters the coordinator keeps across master recoveries.
#[derive(Debug, Default)]
pub struct RecoveryMetrics {
    /// Recoveries started.
    pub recoveries_started: Counter,
    /// Recoveries that finished with every partition recovered.
    pub recoveries_successful: Counter,
    /// Recoveries that were aborted or lost at least one partition.
    pub recoveries_failed: Counter,
    /// Recovery masters that reported failure (or never started).
    pub recovery_master_failures: Counter,
    /// Recoveries currently being driven.
    pub active_recoveries: Gauge,
}

impl RecoveryMetrics {
    /// Create a zeroed metrics block.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_recovery_metrics_start_zeroed() {
        let metrics = RecoveryMetrics::new();
        assert_eq!(metrics.recoveries_started.get(), 0);
        assert_eq!(metrics.active_recoveries.get(), 0);
    }
}
