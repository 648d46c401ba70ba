//! Statistics tracking for the proxy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Atomic counters, reset each time a snapshot is taken.
#[derive(Default)]
pub struct Stats {
    requests: AtomicU64,
    answered_locally: AtomicU64,
    forwarded: AtomicU64,
    completed: AtomicU64,
    expired: AtomicU64,
    misses: AtomicU64,
    decode_errors: AtomicU64,
    /// Cumulative completion time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A client query answered entirely from the override table.
    pub fn record_answered_locally(&self) {
        self.answered_locally.fetch_add(1, Ordering::Relaxed);
    }

    /// Sub-queries sent upstream.
    pub fn record_forwarded(&self, sub_queries: usize) {
        self.forwarded
            .fetch_add(sub_queries as u64, Ordering::Relaxed);
    }

    pub fn record_completed(&self, elapsed: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let answered_locally = self.answered_locally.swap(0, Ordering::Relaxed);
        let forwarded = self.forwarded.swap(0, Ordering::Relaxed);
        let completed = self.completed.swap(0, Ordering::Relaxed);
        let expired = self.expired.swap(0, Ordering::Relaxed);
        let misses = self.misses.swap(0, Ordering::Relaxed);
        let decode_errors = self.decode_errors.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_upstream_ms = if completed > 0 {
            (total_us as f64 / completed as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            answered_locally,
            forwarded,
            completed,
            expired,
            misses,
            decode_errors,
            avg_upstream_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub answered_locally: u64,
    pub forwarded: u64,
    pub completed: u64,
    pub expired: u64,
    pub misses: u64,
    pub decode_errors: u64,
    pub avg_upstream_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_resets_counters() {
        let stats = Stats::new();
        stats.record_request();
        stats.record_request();
        stats.record_forwarded(3);
        stats.record_completed(Duration::from_millis(4));
        stats.record_completed(Duration::from_millis(2));

        let snapshot = stats.snapshot_and_reset();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.forwarded, 3);
        assert_eq!(snapshot.completed, 2);
        assert!((snapshot.avg_upstream_ms - 3.0).abs() < 1e-9);

        let empty = stats.snapshot_and_reset();
        assert_eq!(empty.requests, 0);
        assert_eq!(empty.avg_upstream_ms, 0.0);
    }
}
