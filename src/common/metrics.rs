//! Runtime counters for the leadership runner and the shuffle bridge
//!
//! Plain atomics, read by the simulator and by tests. Exporting them is left
//! to the embedding service.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for tracking event counts
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-job leadership runner metrics
#[derive(Debug, Default)]
pub struct RunnerMetrics {
    pub grants: Counter,
    pub revokes: Counter,
    pub processes_started: Counter,
    pub processes_stopped: Counter,
    pub initialization_failures: Counter,
    /// Completions, constructions and replies dropped because their session was superseded
    pub stale_rejections: Counter,
    pub running_processes: Gauge,
}

impl RunnerMetrics {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "grants": self.grants.get(),
            "revokes": self.revokes.get(),
            "processes_started": self.processes_started.get(),
            "processes_stopped": self.processes_stopped.get(),
            "initialization_failures": self.initialization_failures.get(),
            "stale_rejections": self.stale_rejections.get(),
            "running_processes": self.running_processes.get(),
        })
    }
}

/// Per-bridge shuffle metrics
#[derive(Debug, Default)]
pub struct ShuffleMetrics {
    pub partitions_released: Counter,
    pub redundant_releases: Counter,
    pub metric_queries: Counter,
    pub incomplete_metric_queries: Counter,
    pub rejected_calls: Counter,
}

impl ShuffleMetrics {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "partitions_released": self.partitions_released.get(),
            "redundant_releases": self.redundant_releases.get(),
            "metric_queries": self.metric_queries.get(),
            "incomplete_metric_queries": self.incomplete_metric_queries.get(),
            "rejected_calls": self.rejected_calls.get(),
        })
    }
}
