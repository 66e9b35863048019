//! Access to worker nodes (task executors) holding partitions

use crate::common::{JobId, ResourceId, Result, ResultPartitionId};
use crate::shuffle::partition::PartitionWithMetrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// RPC surface of one worker, as seen by a job's shuffle bridge
#[async_trait]
pub trait TaskExecutorGateway: Send + Sync {
    fn resource_id(&self) -> &ResourceId;

    /// Metrics for every partition of `job_id` held by this worker.
    async fn partitions_with_metrics(&self, job_id: JobId) -> Result<Vec<PartitionWithMetrics>>;

    /// Drop the given partitions of `job_id` from local storage.
    async fn release_partitions(&self, job_id: JobId, partitions: Vec<ResultPartitionId>)
        -> Result<()>;
}

/// Resolves worker ids to gateways
pub trait WorkerDirectory: Send + Sync {
    fn gateway(&self, worker: &ResourceId) -> Option<Arc<dyn TaskExecutorGateway>>;
}

/// Worker directory backed by an explicit registration map
#[derive(Default)]
pub struct StaticWorkerDirectory {
    workers: RwLock<HashMap<ResourceId, Arc<dyn TaskExecutorGateway>>>,
}

impl StaticWorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, gateway: Arc<dyn TaskExecutorGateway>) {
        let id = gateway.resource_id().clone();
        tracing::debug!(worker = %id, "Registering worker");
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, gateway);
    }

    pub fn unregister(&self, worker: &ResourceId) -> bool {
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(worker)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WorkerDirectory for StaticWorkerDirectory {
    fn gateway(&self, worker: &ResourceId) -> Option<Arc<dyn TaskExecutorGateway>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct IdleWorker {
        id: ResourceId,
    }

    #[async_trait]
    impl TaskExecutorGateway for IdleWorker {
        fn resource_id(&self) -> &ResourceId {
            &self.id
        }

        async fn partitions_with_metrics(&self, _job_id: JobId) -> Result<Vec<PartitionWithMetrics>> {
            Ok(Vec::new())
        }

        async fn release_partitions(
            &self,
            _job_id: JobId,
            _partitions: Vec<ResultPartitionId>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_unregister() {
        let directory = StaticWorkerDirectory::new();
        assert!(directory.is_empty());

        directory.register(Arc::new(IdleWorker {
            id: ResourceId::new("tm-1"),
        }));
        assert_eq!(directory.len(), 1);
        assert!(directory.gateway(&ResourceId::new("tm-1")).is_some());
        assert!(directory.gateway(&ResourceId::new("tm-2")).is_none());

        assert!(directory.unregister(&ResourceId::new("tm-1")));
        assert!(!directory.unregister(&ResourceId::new("tm-1")));
        assert!(directory.is_empty());
    }
}
