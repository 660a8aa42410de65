//! In-memory router statistics
//!
//! Per-field atomic counters updated by the facade and read through a
//! snapshot accessor. Each field is monotonically consistent on its own;
//! fields may be slightly mutually inconsistent, which is acceptable.
//!
//! Costs arrive from the adapters already in display currency and
//! accumulate in micro-units so additions stay lock-free.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RouterStats {
    total_requests: AtomicU64,
    local_used: AtomicU64,
    cloud_used: AtomicU64,
    total_cost_micros: AtomicU64,
    total_saved_micros: AtomicU64,
    fallback_count: AtomicU64,
    vision_requests: AtomicU64,
}

/// Read-only view of the counters.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub local_used: u64,
    pub cloud_used: u64,
    pub total_cost: f64,
    pub total_saved: f64,
    pub fallback_count: u64,
    pub vision_requests: u64,
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_vision(&self) {
        self.vision_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallback_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Account a completed request: which side served it and what it cost.
    pub fn record_completion(&self, used_local: bool, cost: f64, saved: f64) {
        if used_local {
            self.local_used.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cloud_used.fetch_add(1, Ordering::Relaxed);
        }
        self.total_cost_micros
            .fetch_add(to_micros(cost), Ordering::Relaxed);
        self.total_saved_micros
            .fetch_add(to_micros(saved), Ordering::Relaxed);
    }

    /// Current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            local_used: self.local_used.load(Ordering::Relaxed),
            cloud_used: self.cloud_used.load(Ordering::Relaxed),
            total_cost: from_micros(self.total_cost_micros.load(Ordering::Relaxed)),
            total_saved: from_micros(self.total_saved_micros.load(Ordering::Relaxed)),
            fallback_count: self.fallback_count.load(Ordering::Relaxed),
            vision_requests: self.vision_requests.load(Ordering::Relaxed),
        }
    }
}

fn to_micros(dollars: f64) -> u64 {
    if dollars <= 0.0 || !dollars.is_finite() {
        return 0;
    }
    (dollars * 1_000_000.0).round() as u64
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}
