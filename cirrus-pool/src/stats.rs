//! Pool statistics.

use std::time::Duration;

use crate::lifecycle::LifecycleStats;

/// Samples retained per tracker.
const DEFAULT_WINDOW: usize = 1024;

/// Latency summary over the most recent samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    /// Samples in the window.
    pub count: usize,
    pub avg: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

/// Fixed-size ring of latency samples.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    samples: Vec<Duration>,
    next: usize,
    window: usize,
}

impl LatencyTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    #[must_use]
    pub fn with_window(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: Vec::with_capacity(window.min(DEFAULT_WINDOW)),
            next: 0,
            window,
        }
    }

    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() < self.window {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
        }
        self.next = (self.next + 1) % self.window;
    }

    /// Nearest-rank percentiles over the window.
    #[must_use]
    pub fn snapshot(&self) -> LatencyStats {
        if self.samples.is_empty() {
            return LatencyStats::default();
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let count = sorted.len();
        let total: Duration = sorted.iter().sum();
        let rank = |p: f64| {
            let idx = (p * count as f64).ceil() as usize;
            sorted[idx.clamp(1, count) - 1]
        };

        LatencyStats {
            count,
            avg: total / count as u32,
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Resources created.
    pub total_created: u64,
    /// Resources destroyed, for any reason.
    pub total_destroyed: u64,
    /// Failed creations.
    pub total_create_errors: u64,
    /// Failed destroys.
    pub total_destroy_errors: u64,
    /// Resources destroyed because they failed validation or were disposed.
    pub total_bad_destroyed: u64,
    /// Idle resources reaped.
    pub total_timed_out: u64,
    /// Creations dropped because nobody needed them anymore.
    pub total_create_ignored: u64,
    /// Waiters that cancelled before being served.
    pub total_waiters_cancelled: u64,

    /// Configured maximum size.
    pub max_pool_size: usize,
    /// Configured minimum size.
    pub min_pool_size: usize,
    /// Idle, checked out and being created.
    pub pool_size: usize,
    /// Largest `pool_size` observed.
    pub sample_max_pool_size: usize,
    /// Idle resources.
    pub idle: usize,
    /// Checked-out resources.
    pub outstanding: usize,
    /// Largest `outstanding` observed.
    pub max_outstanding: usize,
    /// Queued callers.
    pub waiters: usize,

    /// Time spent in `Lifecycle::create`.
    pub creation_latency: LatencyStats,
    /// Time callers spent queued before being served.
    pub wait_latency: LatencyStats,

    /// Counters reported by the pool's lifecycle.
    pub lifecycle: LifecycleStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tracker() {
        assert_eq!(LatencyTracker::new().snapshot(), LatencyStats::default());
    }

    #[test]
    fn test_percentiles() {
        let mut tracker = LatencyTracker::new();
        for ms in 1..=100 {
            tracker.record(Duration::from_millis(ms));
        }

        let stats = tracker.snapshot();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.p50, Duration::from_millis(50));
        assert_eq!(stats.p95, Duration::from_millis(95));
        assert_eq!(stats.p99, Duration::from_millis(99));
        assert_eq!(stats.avg, Duration::from_micros(50_500));
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut tracker = LatencyTracker::with_window(3);
        for ms in [100, 1, 2, 3] {
            tracker.record(Duration::from_millis(ms));
        }

        let stats = tracker.snapshot();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.p99, Duration::from_millis(3));
    }
}
