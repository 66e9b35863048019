//! Job-facing side of the shuffle contract
//!
//! The shuffle master talks to each job through a [`JobShuffleContext`]: it
//! learns the job id, tells the job to forget partitions that were lost on a
//! worker, and asks for partition metrics across workers.
//!
//! [`ShuffleContextBridge`] is the implementation owned by one job master
//! process. It is bound to that process's leadership session and refuses
//! every call once the session is superseded or the process starts tearing
//! down.

use crate::common::{
    Error, JobEvent, JobEventKind, JobId, EventReporter, ResourceId, Result, ResultPartitionId,
    ShuffleConfig, ShuffleMetrics,
};
use crate::jobmaster::fencing::SessionGuard;
use crate::shuffle::partition::PartitionMetricsReport;
use crate::shuffle::tracker::{LostPartitionQueue, PartitionTracker, TrackedPartition};
use crate::shuffle::worker::WorkerDirectory;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Capability the shuffle master holds for one job
#[async_trait]
pub trait JobShuffleContext: Send + Sync {
    fn job_id(&self) -> JobId;

    /// Forget the given partitions; they are gone and must be recomputed if
    /// referenced again. Unknown or already released ids are a no-op.
    async fn stop_tracking_and_release_partitions(&self, ids: &[ResultPartitionId]) -> Result<()>;

    /// Metrics of the job's partitions on every worker that holds some.
    async fn get_all_partition_with_metrics_on_task_managers(&self)
        -> Result<PartitionMetricsReport>;
}

pub struct ShuffleContextBridge {
    session: SessionGuard,
    tracker: Arc<dyn PartitionTracker>,
    workers: Arc<dyn WorkerDirectory>,
    lost: Arc<LostPartitionQueue>,
    events: Arc<dyn EventReporter>,
    config: ShuffleConfig,
    closed: AtomicBool,
    metrics: ShuffleMetrics,
}

impl ShuffleContextBridge {
    pub fn new(
        session: SessionGuard,
        tracker: Arc<dyn PartitionTracker>,
        workers: Arc<dyn WorkerDirectory>,
        lost: Arc<LostPartitionQueue>,
        events: Arc<dyn EventReporter>,
        config: ShuffleConfig,
    ) -> Self {
        Self {
            session,
            tracker,
            workers,
            lost,
            events,
            config,
            closed: AtomicBool::new(false),
            metrics: ShuffleMetrics::default(),
        }
    }

    /// Begin teardown: every later call is rejected.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(job_id = %self.job_id(), session = %self.session.session(), "Shuffle context closed");
        }
    }

    pub fn is_available(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.session.is_valid()
    }

    pub fn tracker(&self) -> &Arc<dyn PartitionTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &ShuffleMetrics {
        &self.metrics
    }

    fn ensure_available(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            self.metrics.rejected_calls.inc();
            return Err(Error::ShuffleContextUnavailable(self.job_id()));
        }
        if let Err(e) = self.session.check() {
            self.metrics.rejected_calls.inc();
            return Err(e);
        }
        Ok(())
    }

    /// Best-effort physical release on the producing workers.
    fn release_on_workers(&self, released: &[TrackedPartition]) {
        let mut by_producer: HashMap<ResourceId, Vec<ResultPartitionId>> = HashMap::new();
        for partition in released {
            by_producer
                .entry(partition.producer.clone())
                .or_default()
                .push(partition.id);
        }

        let job_id = self.job_id();
        for (producer, ids) in by_producer {
            let Some(gateway) = self.workers.gateway(&producer) else {
                tracing::debug!(%job_id, worker = %producer, "Producer not registered, skipping physical release");
                continue;
            };
            tokio::spawn(async move {
                if let Err(e) = gateway.release_partitions(job_id, ids).await {
                    tracing::warn!(%job_id, worker = %producer, error = %e, "Failed to release partitions on worker");
                }
            });
        }
    }
}

#[async_trait]
impl JobShuffleContext for ShuffleContextBridge {
    fn job_id(&self) -> JobId {
        self.session.job_id()
    }

    async fn stop_tracking_and_release_partitions(&self, ids: &[ResultPartitionId]) -> Result<()> {
        self.ensure_available()?;

        let released = self.tracker.stop_tracking(ids);
        let redundant = ids.len().saturating_sub(released.len()) as u64;
        self.metrics.partitions_released.add(released.len() as u64);
        self.metrics.redundant_releases.add(redundant);

        if released.is_empty() {
            tracing::debug!(job_id = %self.job_id(), requested = ids.len(), "No tracked partitions to release");
            return Ok(());
        }

        // consumers are marked for re-execution before the ack
        self.lost.mark_lost(&released);

        tracing::info!(
            job_id = %self.job_id(),
            released = released.len(),
            redundant,
            "Stopped tracking lost partitions"
        );
        self.events.notify_of_added_event(
            &JobEvent::new(
                self.job_id(),
                JobEventKind::PartitionsReleased,
                format!("{} partitions released", released.len()),
            )
            .with_session(self.session.session())
            .with_attributes(json!({ "released": released.len(), "redundant": redundant })),
        );

        if self.config.release_partitions_on_workers {
            self.release_on_workers(&released);
        }
        Ok(())
    }

    async fn get_all_partition_with_metrics_on_task_managers(
        &self,
    ) -> Result<PartitionMetricsReport> {
        self.ensure_available()?;
        self.metrics.metric_queries.inc();

        let job_id = self.job_id();
        let timeout = self.config.metrics_query_timeout();
        let queries = self.tracker.producers().into_iter().map(|producer| {
            let gateway = self.workers.gateway(&producer);
            async move {
                let reply = match gateway {
                    None => Err(Error::WorkerUnreachable {
                        worker: producer.clone(),
                        reason: "not registered".into(),
                    }),
                    Some(gateway) => {
                        match tokio::time::timeout(timeout, gateway.partitions_with_metrics(job_id))
                            .await
                        {
                            Ok(reply) => reply,
                            Err(_) => Err(Error::Timeout(format!(
                                "partition metrics from {} after {:?}",
                                producer, timeout
                            ))),
                        }
                    }
                };
                (producer, reply)
            }
        });

        let mut report = PartitionMetricsReport::default();
        for (producer, reply) in join_all(queries).await {
            match reply {
                Ok(partitions) => {
                    report.partitions.extend(partitions);
                    report.responded.push(producer);
                }
                Err(e) => {
                    tracing::warn!(%job_id, worker = %producer, error = %e, "Worker did not report partition metrics");
                    report.unresponsive.push(producer);
                }
            }
        }

        // teardown may have started while we were waiting
        self.ensure_available()?;

        if !report.is_complete() {
            self.metrics.incomplete_metric_queries.inc();
            self.events.notify_of_added_event(
                &JobEvent::new(
                    job_id,
                    JobEventKind::PartitionMetricsIncomplete,
                    format!("{} workers did not respond", report.unresponsive.len()),
                )
                .with_attributes(json!({
                    "responded": report.responded.len(),
                    "unresponsive": report.unresponsive.len(),
                })),
            );
        }
        Ok(report)
    }
}
