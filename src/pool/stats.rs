// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use serde::Serialize;
use std::time::{Duration, Instant};

/// Point-in-time view of the pool, published on every state change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub starting_workers: usize,
    pub queue_length: usize,
    pub in_flight: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub average_duration_ms: f64,
}

/// Lifetime totals. Survive `terminate`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Totals {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    total_duration: Duration,
}

impl Totals {
    pub fn record_success(&mut self, duration: Duration) {
        self.completed += 1;
        self.total_duration += duration;
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn record_cancel(&mut self) {
        self.cancelled += 1;
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        self.total_duration.as_secs_f64() * 1000.0 / self.completed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_only_counts_successes() {
        let mut totals = Totals::default();
        assert_eq!(totals.average_duration_ms(), 0.0);

        totals.record_success(Duration::from_millis(10));
        totals.record_success(Duration::from_millis(30));
        totals.record_failure();
        totals.record_cancel();

        assert_eq!(totals.completed, 2);
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.cancelled, 1);
        assert!((totals.average_duration_ms() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let json = serde_json::to_value(PoolStats::default()).unwrap();
        assert!(json.get("queueLength").is_some());
        assert!(json.get("averageDurationMs").is_some());
    }
}
