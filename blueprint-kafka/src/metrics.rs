//! Per-client counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters kept by each producer, consumer and admin client
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Producer metrics
    pub records_produced: AtomicU64,
    pub bytes_produced: AtomicU64,
    pub produce_errors: AtomicU64,
    pub produce_latency_sum: AtomicU64,
    pub produce_latency_count: AtomicU64,

    // Consumer metrics
    pub records_consumed: AtomicU64,
    pub bytes_consumed: AtomicU64,
    pub polls: AtomicU64,
    pub fetch_errors: AtomicU64,
    pub commits: AtomicU64,
    pub commit_errors: AtomicU64,

    // Transaction metrics
    pub transactions_committed: AtomicU64,
    pub transactions_aborted: AtomicU64,
}

impl ClientMetrics {
    /// Record an acknowledged record
    pub fn record_produce(&self, byte_count: u64, latency: Duration) {
        self.records_produced.fetch_add(1, Ordering::Relaxed);
        self.bytes_produced.fetch_add(byte_count, Ordering::Relaxed);
        self.produce_latency_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.produce_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_produce_error(&self) {
        self.produce_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one poll
    pub fn record_poll(&self, record_count: u64, byte_count: u64, error_count: u64) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.records_consumed.fetch_add(record_count, Ordering::Relaxed);
        self.bytes_consumed.fetch_add(byte_count, Ordering::Relaxed);
        self.fetch_errors.fetch_add(error_count, Ordering::Relaxed);
    }

    pub fn record_commit(&self, ok: bool) {
        if ok {
            self.commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commit_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_transaction(&self, committed: bool) {
        if committed {
            self.transactions_committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get average produce latency in microseconds
    pub fn average_produce_latency_us(&self) -> f64 {
        let sum = self.produce_latency_sum.load(Ordering::Relaxed);
        let count = self.produce_latency_count.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_produced: self.records_produced.load(Ordering::Relaxed),
            bytes_produced: self.bytes_produced.load(Ordering::Relaxed),
            produce_errors: self.produce_errors.load(Ordering::Relaxed),
            average_produce_latency_us: self.average_produce_latency_us(),
            records_consumed: self.records_consumed.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_errors: self.commit_errors.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_aborted: self.transactions_aborted.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub records_produced: u64,
    pub bytes_produced: u64,
    pub produce_errors: u64,
    pub average_produce_latency_us: f64,
    pub records_consumed: u64,
    pub bytes_consumed: u64,
    pub polls: u64,
    pub fetch_errors: u64,
    pub commits: u64,
    pub commit_errors: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
}

/// Timing helper for measuring operation latency
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = ClientMetrics::default();
        metrics.record_produce(10, Duration::from_micros(100));
        metrics.record_produce(20, Duration::from_micros(300));
        metrics.record_produce_error();
        metrics.record_poll(3, 30, 1);
        metrics.record_commit(true);
        metrics.record_commit(false);
        metrics.record_transaction(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_produced, 2);
        assert_eq!(snapshot.bytes_produced, 30);
        assert_eq!(snapshot.produce_errors, 1);
        assert_eq!(snapshot.average_produce_latency_us, 200.0);
        assert_eq!(snapshot.records_consumed, 3);
        assert_eq!(snapshot.fetch_errors, 1);
        assert_eq!(snapshot.commits, 1);
        assert_eq!(snapshot.commit_errors, 1);
        assert_eq!(snapshot.transactions_aborted, 1);
    }

    #[test]
    fn test_empty_latency() {
        assert_eq!(ClientMetrics::default().average_produce_latency_us(), 0.0);
    }
}
