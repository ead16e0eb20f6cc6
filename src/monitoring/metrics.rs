//! Coordinator counters.
//!
//! Lock-free atomics, readable as a serializable snapshot.

use crate::core::{now, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric (monotonically increasing).
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by amount.
    pub fn add(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Get current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters maintained by the coordinator components.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub probes_succeeded: Counter,
    pub probes_failed: Counter,
    pub deliveries_acked: Counter,
    pub deliveries_superseded: Counter,
    pub delivery_retries: Counter,
    pub deliveries_failed: Counter,
    pub failovers_completed: Counter,
    pub failovers_suppressed: Counter,
    pub promotions_aborted: Counter,
    pub topology_publications: Counter,
}

/// Point-in-time copy of [`CoordinatorMetrics`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: Timestamp,
    pub probes_succeeded: u64,
    pub probes_failed: u64,
    pub deliveries_acked: u64,
    pub deliveries_superseded: u64,
    pub delivery_retries: u64,
    pub deliveries_failed: u64,
    pub failovers_completed: u64,
    pub failovers_suppressed: u64,
    pub promotions_aborted: u64,
    pub topology_publications: u64,
}

impl CoordinatorMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: now(),
            probes_succeeded: self.probes_succeeded.get(),
            probes_failed: self.probes_failed.get(),
            deliveries_acked: self.deliveries_acked.get(),
            deliveries_superseded: self.deliveries_superseded.get(),
            delivery_retries: self.delivery_retries.get(),
            deliveries_failed: self.deliveries_failed.get(),
            failovers_completed: self.failovers_completed.get(),
            failovers_suppressed: self.failovers_suppressed.get(),
            promotions_aborted: self.promotions_aborted.get(),
            topology_publications: self.topology_publications.get(),
        }
    }
}
