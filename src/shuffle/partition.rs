//! Partition metrics snapshots

use crate::common::{ResourceId, ResultPartitionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time metrics for one partition, as reported by its worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionWithMetrics {
    pub partition: ResultPartitionId,
    pub producer: ResourceId,
    pub size_bytes: u64,
    pub num_subpartitions: u32,
    pub produced_at: DateTime<Utc>,
}

impl PartitionWithMetrics {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.produced_at)
    }
}

/// Aggregated answer of one metrics fan-out.
///
/// Workers that failed or did not answer in time are listed in
/// `unresponsive`; their partitions are absent from `partitions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionMetricsReport {
    pub partitions: Vec<PartitionWithMetrics>,
    pub responded: Vec<ResourceId>,
    pub unresponsive: Vec<ResourceId>,
}

impl PartitionMetricsReport {
    pub fn is_complete(&self) -> bool {
        self.unresponsive.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.partitions.iter().map(|p| p.size_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(producer: &str, size_bytes: u64) -> PartitionWithMetrics {
        PartitionWithMetrics {
            partition: ResultPartitionId::new(),
            producer: ResourceId::new(producer),
            size_bytes,
            num_subpartitions: 4,
            produced_at: Utc::now(),
        }
    }

    #[test]
    fn test_report_totals_and_completeness() {
        let mut report = PartitionMetricsReport {
            partitions: vec![metrics("tm-1", 100), metrics("tm-2", 50)],
            responded: vec![ResourceId::new("tm-1"), ResourceId::new("tm-2")],
            unresponsive: vec![],
        };
        assert!(report.is_complete());
        assert_eq!(report.total_bytes(), 150);

        report.unresponsive.push(ResourceId::new("tm-3"));
        assert!(!report.is_complete());
    }

    #[test]
    fn test_age() {
        let mut p = metrics("tm-1", 1);
        let now = Utc::now();
        p.produced_at = now - chrono::Duration::seconds(30);
        assert_eq!(p.age(now).num_seconds(), 30);
    }
}
