//! Building job master processes for a granted session

use crate::common::{Error, EventReporter, JobId, Result, ShuffleConfig};
use crate::jobmaster::fencing::SessionGuard;
use crate::jobmaster::job::JobDefinition;
use crate::jobmaster::process::{
    CompletionHandle, JobMasterService, JobMasterServiceProcess, ShuffleBinding,
};
use crate::shuffle::context::ShuffleContextBridge;
use crate::shuffle::master::ShuffleMaster;
use crate::shuffle::tracker::{JobPartitionTracker, LostPartitionQueue, PartitionTracker, TrackedPartition};
use crate::shuffle::worker::WorkerDirectory;
use async_trait::async_trait;
use std::sync::Arc;

/// Produces one process per granted session.
///
/// `create` is invoked at most once per session. The returned future may be
/// dropped before completion when the session is revoked mid-construction.
#[async_trait]
pub trait JobMasterServiceProcessFactory: Send + Sync {
    fn job_id(&self) -> JobId;

    async fn create(&self, session: SessionGuard) -> Result<Arc<JobMasterServiceProcess>>;
}

/// Everything the coordinator logic of one process gets to work with
#[derive(Clone)]
pub struct JobMasterContext {
    pub definition: Arc<JobDefinition>,
    pub session: SessionGuard,
    pub partitions: Arc<dyn PartitionTracker>,
    pub lost_partitions: Arc<LostPartitionQueue>,
    pub completion: CompletionHandle,
    shuffle_master: Arc<ShuffleMaster>,
}

impl JobMasterContext {
    pub fn job_id(&self) -> JobId {
        self.definition.job_id
    }

    /// Record a partition finished by a producer. Refused once the session
    /// is superseded.
    pub fn partition_produced(&self, partition: TrackedPartition) -> bool {
        if !self.session.is_valid() {
            tracing::debug!(job_id = %self.job_id(), partition = %partition.id, "Dropping partition from superseded session");
            return false;
        }
        self.shuffle_master.register_partition_with_producer(
            self.job_id(),
            partition.id,
            partition.producer.clone(),
        );
        self.partitions.start_tracking(partition);
        true
    }
}

/// Builds the coordinator logic itself
#[async_trait]
pub trait JobMasterServiceFactory: Send + Sync {
    async fn create_service(&self, context: JobMasterContext) -> Result<Arc<dyn JobMasterService>>;
}

/// Wires a fresh partition tracker and shuffle context around the service
/// built by a [`JobMasterServiceFactory`].
pub struct DefaultJobMasterServiceProcessFactory {
    definition: Arc<JobDefinition>,
    services: Arc<dyn JobMasterServiceFactory>,
    shuffle_master: Arc<ShuffleMaster>,
    workers: Arc<dyn WorkerDirectory>,
    events: Arc<dyn EventReporter>,
    config: ShuffleConfig,
}

impl DefaultJobMasterServiceProcessFactory {
    pub fn new(
        definition: JobDefinition,
        services: Arc<dyn JobMasterServiceFactory>,
        shuffle_master: Arc<ShuffleMaster>,
        workers: Arc<dyn WorkerDirectory>,
        events: Arc<dyn EventReporter>,
        config: ShuffleConfig,
    ) -> Self {
        Self {
            definition: Arc::new(definition),
            services,
            shuffle_master,
            workers,
            events,
            config,
        }
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }
}

#[async_trait]
impl JobMasterServiceProcessFactory for DefaultJobMasterServiceProcessFactory {
    fn job_id(&self) -> JobId {
        self.definition.job_id
    }

    async fn create(&self, session: SessionGuard) -> Result<Arc<JobMasterServiceProcess>> {
        let job_id = self.definition.job_id;
        tracing::debug!(%job_id, session = %session.session(), "Creating job master process");

        let tracker: Arc<dyn PartitionTracker> = Arc::new(JobPartitionTracker::new(job_id));
        let lost = Arc::new(LostPartitionQueue::new());
        let bridge = Arc::new(ShuffleContextBridge::new(
            session.clone(),
            tracker.clone(),
            self.workers.clone(),
            lost.clone(),
            self.events.clone(),
            self.config.clone(),
        ));
        let completion = CompletionHandle::new(job_id);

        let context = JobMasterContext {
            definition: self.definition.clone(),
            session: session.clone(),
            partitions: tracker,
            lost_partitions: lost,
            completion: completion.clone(),
            shuffle_master: self.shuffle_master.clone(),
        };

        let service = self
            .services
            .create_service(context)
            .await
            .map_err(|e| match e {
                Error::InitializationFailed { .. } => e,
                other => Error::InitializationFailed {
                    job_id,
                    reason: other.to_string(),
                },
            })?;

        let registration = self.shuffle_master.register_job(bridge.clone());
        Ok(Arc::new(JobMasterServiceProcess::new(
            session,
            service,
            completion,
            Some(ShuffleBinding {
                bridge,
                master: self.shuffle_master.clone(),
                registration,
            }),
        )))
    }
}
