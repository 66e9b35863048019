//! Cluster-side shuffle master
//!
//! Keeps one [`JobShuffleContext`] per registered job and the location of
//! every partition registered with it. When a worker is lost, the master
//! asks every affected job to stop tracking the partitions that lived there.

use crate::common::{
    EventReporter, JobEvent, JobEventKind, JobId, ResourceId, Result, ResultPartitionId,
    TracingEventReporter,
};
use crate::shuffle::context::JobShuffleContext;
use crate::shuffle::partition::PartitionMetricsReport;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Identifies one registration of a job context.
///
/// A process unregisters with the id it got back, so a late unregister from
/// a superseded process never removes its successor's context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShuffleRegistration(u64);

struct Registered {
    registration: ShuffleRegistration,
    context: Arc<dyn JobShuffleContext>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    job_id: JobId,
    producer: ResourceId,
}

/// Outcome of dispatching one worker loss to the registered jobs
#[derive(Debug, Clone, Serialize)]
pub struct WorkerLossReport {
    pub worker: ResourceId,
    pub jobs_notified: Vec<JobId>,
    pub jobs_rejected: Vec<JobId>,
    pub partitions: usize,
}

pub struct ShuffleMaster {
    jobs: RwLock<HashMap<JobId, Registered>>,
    locations: RwLock<HashMap<ResultPartitionId, Location>>,
    next_registration: AtomicU64,
    events: Arc<dyn EventReporter>,
}

impl Default for ShuffleMaster {
    fn default() -> Self {
        Self::with_events(Arc::new(TracingEventReporter))
    }
}

impl ShuffleMaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Master reporting a `WorkerLost` event to every job that accepted a loss.
    pub fn with_events(events: Arc<dyn EventReporter>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            locations: RwLock::new(HashMap::new()),
            next_registration: AtomicU64::new(0),
            events,
        }
    }

    /// Register the context of a job, replacing any earlier one.
    pub fn register_job(&self, context: Arc<dyn JobShuffleContext>) -> ShuffleRegistration {
        let job_id = context.job_id();
        let registration =
            ShuffleRegistration(self.next_registration.fetch_add(1, Ordering::SeqCst) + 1);
        let previous = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                job_id,
                Registered {
                    registration,
                    context,
                },
            );
        if previous.is_some() {
            tracing::debug!(%job_id, "Replaced shuffle context of job");
        } else {
            tracing::debug!(%job_id, "Registered shuffle context of job");
        }
        registration
    }

    /// Remove the job's context if it is still the one `registration` refers to.
    pub fn unregister_job(&self, job_id: JobId, registration: ShuffleRegistration) -> bool {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        match jobs.get(&job_id) {
            Some(r) if r.registration == registration => {
                jobs.remove(&job_id);
            }
            _ => return false,
        }
        drop(jobs);

        self.locations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, loc| loc.job_id != job_id);
        tracing::debug!(%job_id, "Unregistered shuffle context of job");
        true
    }

    pub fn register_partition_with_producer(
        &self,
        job_id: JobId,
        partition: ResultPartitionId,
        producer: ResourceId,
    ) {
        self.locations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partition, Location { job_id, producer });
    }

    /// Forget a partition released through a path other than worker loss.
    pub fn release_partition_externally(&self, partition: &ResultPartitionId) -> bool {
        self.locations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(partition)
            .is_some()
    }

    pub fn context(&self, job_id: JobId) -> Option<Arc<dyn JobShuffleContext>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .map(|r| r.context.clone())
    }

    pub fn registered_jobs(&self) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        jobs.sort();
        jobs
    }

    pub fn partitions_on(&self, worker: &ResourceId) -> usize {
        self.locations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|loc| &loc.producer == worker)
            .count()
    }

    /// Tell every job with partitions on `worker` that they are gone.
    ///
    /// Jobs whose context rejects the call (superseded or tearing down) are
    /// listed in `jobs_rejected`; their locations are dropped regardless.
    pub async fn notify_worker_lost(&self, worker: &ResourceId) -> WorkerLossReport {
        let mut by_job: BTreeMap<JobId, Vec<ResultPartitionId>> = BTreeMap::new();
        {
            let mut locations = self.locations.write().unwrap_or_else(PoisonError::into_inner);
            locations.retain(|id, loc| {
                if &loc.producer == worker {
                    by_job.entry(loc.job_id).or_default().push(*id);
                    false
                } else {
                    true
                }
            });
        }

        let mut report = WorkerLossReport {
            worker: worker.clone(),
            jobs_notified: Vec::new(),
            jobs_rejected: Vec::new(),
            partitions: 0,
        };
        for (job_id, ids) in by_job {
            report.partitions += ids.len();
            let Some(context) = self.context(job_id) else {
                tracing::debug!(%job_id, worker = %worker, "No shuffle context for job, dropping locations");
                continue;
            };
            match context.stop_tracking_and_release_partitions(&ids).await {
                Ok(()) => {
                    self.events.notify_of_added_event(
                        &JobEvent::new(job_id, JobEventKind::WorkerLost, "worker lost")
                            .with_attributes(json!({
                                "worker": worker.as_str(),
                                "partitions": ids.len(),
                            })),
                    );
                    report.jobs_notified.push(job_id);
                }
                Err(e) => {
                    tracing::warn!(%job_id, worker = %worker, error = %e, "Job rejected partition release");
                    report.jobs_rejected.push(job_id);
                }
            }
        }

        tracing::info!(
            worker = %worker,
            partitions = report.partitions,
            notified = report.jobs_notified.len(),
            rejected = report.jobs_rejected.len(),
            "Worker lost"
        );
        report
    }

    /// Metrics of the job's partitions, if the job is registered.
    pub async fn partition_metrics(&self, job_id: JobId) -> Option<Result<PartitionMetricsReport>> {
        let context = self.context(job_id)?;
        Some(context.get_all_partition_with_metrics_on_task_managers().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Error, MemoryEventReporter};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingContext {
        job_id: JobId,
        reject: bool,
        released: Mutex<Vec<ResultPartitionId>>,
    }

    impl RecordingContext {
        fn new(job_id: JobId, reject: bool) -> Arc<Self> {
            Arc::new(Self {
                job_id,
                reject,
                released: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl JobShuffleContext for RecordingContext {
        fn job_id(&self) -> JobId {
            self.job_id
        }

        async fn stop_tracking_and_release_partitions(
            &self,
            ids: &[ResultPartitionId],
        ) -> Result<()> {
            if self.reject {
                return Err(Error::ShuffleContextUnavailable(self.job_id));
            }
            self.released.lock().unwrap().extend_from_slice(ids);
            Ok(())
        }

        async fn get_all_partition_with_metrics_on_task_managers(
            &self,
        ) -> Result<PartitionMetricsReport> {
            Ok(PartitionMetricsReport::default())
        }
    }

    #[test]
    fn test_stale_unregister_keeps_successor() {
        let master = ShuffleMaster::new();
        let job_id = JobId::new();
        let first = master.register_job(RecordingContext::new(job_id, false));
        let second = master.register_job(RecordingContext::new(job_id, false));

        assert!(!master.unregister_job(job_id, first));
        assert_eq!(master.registered_jobs(), vec![job_id]);
        assert!(master.unregister_job(job_id, second));
        assert!(master.registered_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_worker_lost_dispatches_per_job() {
        let events = Arc::new(MemoryEventReporter::new());
        let master = ShuffleMaster::with_events(events.clone());
        let (job_a, job_b) = (JobId::new(), JobId::new());
        let ctx_a = RecordingContext::new(job_a, false);
        let ctx_b = RecordingContext::new(job_b, true);
        master.register_job(ctx_a.clone());
        master.register_job(ctx_b.clone());

        let lost = ResourceId::new("tm-1");
        let p1 = ResultPartitionId::new();
        let p2 = ResultPartitionId::new();
        let p3 = ResultPartitionId::new();
        master.register_partition_with_producer(job_a, p1, lost.clone());
        master.register_partition_with_producer(job_a, p2, ResourceId::new("tm-2"));
        master.register_partition_with_producer(job_b, p3, lost.clone());

        let report = master.notify_worker_lost(&lost).await;

        assert_eq!(report.partitions, 2);
        assert_eq!(report.jobs_notified, vec![job_a]);
        assert_eq!(report.jobs_rejected, vec![job_b]);
        assert_eq!(*ctx_a.released.lock().unwrap(), vec![p1]);
        assert_eq!(master.partitions_on(&lost), 0);
        assert_eq!(master.partitions_on(&ResourceId::new("tm-2")), 1);

        let reported = events.events();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].job_id, job_a);
        assert_eq!(reported[0].kind, JobEventKind::WorkerLost);

        // second loss of the same worker finds nothing
        let again = master.notify_worker_lost(&lost).await;
        assert_eq!(again.partitions, 0);
        assert!(again.jobs_notified.is_empty());
        assert_eq!(events.count(JobEventKind::WorkerLost), 1);
    }

    #[tokio::test]
    async fn test_external_release_and_unknown_job_metrics() {
        let master = ShuffleMaster::new();
        let job_id = JobId::new();
        let p = ResultPartitionId::new();
        master.register_partition_with_producer(job_id, p, ResourceId::new("tm-1"));

        assert!(master.release_partition_externally(&p));
        assert!(!master.release_partition_externally(&p));
        assert!(master.partition_metrics(job_id).await.is_none());
    }
}
