//! Engine counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct EngineMetrics {
    start_time: Instant,
    rounds_started: AtomicU64,
    rounds_settled: AtomicU64,
    rounds_voided: AtomicU64,
    wagers_accepted: AtomicU64,
    wagers_rejected: AtomicU64,
    settlement_retries: AtomicU64,
    variant_restarts: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub rounds_started: u64,
    pub rounds_settled: u64,
    pub rounds_voided: u64,
    pub wagers_accepted: u64,
    pub wagers_rejected: u64,
    pub settlement_retries: u64,
    pub variant_restarts: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            rounds_started: AtomicU64::new(0),
            rounds_settled: AtomicU64::new(0),
            rounds_voided: AtomicU64::new(0),
            wagers_accepted: AtomicU64::new(0),
            wagers_rejected: AtomicU64::new(0),
            settlement_retries: AtomicU64::new(0),
            variant_restarts: AtomicU64::new(0),
        }
    }

    pub fn record_round_started(&self) {
        self.rounds_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round_settled(&self) {
        self.rounds_settled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round_voided(&self) {
        self.rounds_voided.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wager(&self, accepted: bool) {
        let counter = if accepted {
            &self.wagers_accepted
        } else {
            &self.wagers_rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_settlement_retry(&self) {
        self.settlement_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_variant_restart(&self) {
        self.variant_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            rounds_started: self.rounds_started.load(Ordering::Relaxed),
            rounds_settled: self.rounds_settled.load(Ordering::Relaxed),
            rounds_voided: self.rounds_voided.load(Ordering::Relaxed),
            wagers_accepted: self.wagers_accepted.load(Ordering::Relaxed),
            wagers_rejected: self.wagers_rejected.load(Ordering::Relaxed),
            settlement_retries: self.settlement_retries.load(Ordering::Relaxed),
            variant_restarts: self.variant_restarts.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
