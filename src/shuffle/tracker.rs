//! Per-job partition bookkeeping
//!
//! The tracker holds the set of result partitions the job believes exist on
//! workers. Additions come from producers finishing; removals come from the
//! shuffle bridge when partitions are lost. Removal is idempotent.

use crate::common::{JobId, ResourceId, ResultPartitionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

/// A partition and the worker holding it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackedPartition {
    pub id: ResultPartitionId,
    pub producer: ResourceId,
}

impl TrackedPartition {
    pub fn new(id: ResultPartitionId, producer: ResourceId) -> Self {
        Self { id, producer }
    }
}

/// Lookup and removal primitives the shuffle bridge calls into.
///
/// Every method is atomic with respect to the others.
pub trait PartitionTracker: Send + Sync {
    fn job_id(&self) -> JobId;

    /// Start tracking a partition. Re-tracking an id replaces its producer.
    fn start_tracking(&self, partition: TrackedPartition);

    /// Stop tracking the given ids; returns only those that were tracked.
    fn stop_tracking(&self, ids: &[ResultPartitionId]) -> Vec<TrackedPartition>;

    /// Stop tracking everything produced by one worker.
    fn stop_tracking_for_producer(&self, producer: &ResourceId) -> Vec<TrackedPartition>;

    fn is_tracked(&self, id: &ResultPartitionId) -> bool;

    fn tracked_partitions(&self) -> Vec<TrackedPartition>;

    /// Workers currently holding at least one tracked partition.
    fn producers(&self) -> BTreeSet<ResourceId>;
}

/// In-memory tracker for one job
#[derive(Debug)]
pub struct JobPartitionTracker {
    job_id: JobId,
    partitions: Mutex<HashMap<ResultPartitionId, ResourceId>>,
}

impl JobPartitionTracker {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    fn partitions(&self) -> std::sync::MutexGuard<'_, HashMap<ResultPartitionId, ResourceId>> {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartitionTracker for JobPartitionTracker {
    fn job_id(&self) -> JobId {
        self.job_id
    }

    fn start_tracking(&self, partition: TrackedPartition) {
        tracing::trace!(job_id = %self.job_id, partition = %partition.id, producer = %partition.producer, "Tracking partition");
        self.partitions().insert(partition.id, partition.producer);
    }

    fn stop_tracking(&self, ids: &[ResultPartitionId]) -> Vec<TrackedPartition> {
        let mut partitions = self.partitions();
        ids.iter()
            .filter_map(|id| {
                partitions
                    .remove(id)
                    .map(|producer| TrackedPartition::new(*id, producer))
            })
            .collect()
    }

    fn stop_tracking_for_producer(&self, producer: &ResourceId) -> Vec<TrackedPartition> {
        let mut partitions = self.partitions();
        let ids: Vec<ResultPartitionId> = partitions
            .iter()
            .filter(|(_, p)| *p == producer)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| {
                partitions
                    .remove(&id)
                    .map(|producer| TrackedPartition::new(id, producer))
            })
            .collect()
    }

    fn is_tracked(&self, id: &ResultPartitionId) -> bool {
        self.partitions().contains_key(id)
    }

    fn tracked_partitions(&self) -> Vec<TrackedPartition> {
        self.partitions()
            .iter()
            .map(|(id, producer)| TrackedPartition::new(*id, producer.clone()))
            .collect()
    }

    fn producers(&self) -> BTreeSet<ResourceId> {
        self.partitions().values().cloned().collect()
    }
}

/// Partitions whose consumers must be re-executed.
///
/// Filled by the shuffle bridge before it acknowledges a release; drained by
/// the job's scheduler.
#[derive(Debug, Default)]
pub struct LostPartitionQueue {
    lost: Mutex<Vec<TrackedPartition>>,
    notify: Notify,
}

impl LostPartitionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_lost(&self, partitions: &[TrackedPartition]) {
        if partitions.is_empty() {
            return;
        }
        self.lost
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(partitions);
        self.notify.notify_one();
    }

    pub fn drain(&self) -> Vec<TrackedPartition> {
        std::mem::take(&mut *self.lost.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.lost.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least one loss has been marked since the last wake-up.
    pub async fn lost(&self) {
        self.notify.notified().await;
    }
}
