//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use jobmaster_core::common::{
    Error, JobId, MemoryEventReporter, ResourceId, Result, ResultPartitionId, ShuffleConfig,
};
use jobmaster_core::jobmaster::{
    DefaultJobMasterServiceProcessFactory, FatalErrorHandler, JobDefinition, JobMasterContext,
    JobMasterService, JobMasterServiceFactory, JobResult, JobStatus, LeadershipRunner,
    RunnerServices, RunnerState,
};
use jobmaster_core::shuffle::{
    PartitionWithMetrics, ShuffleMaster, StaticWorkerDirectory, TaskExecutorGateway,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const WAIT: Duration = Duration::from_secs(5);

/// One-shot barrier a test opens explicitly
#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn closed() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Records what the testing services did, in order
#[derive(Default)]
pub struct Probe {
    log: Mutex<Vec<String>>,
    live: AtomicUsize,
    max_live: AtomicUsize,
    pub created: AtomicUsize,
}

impl Probe {
    pub fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.log.lock().unwrap().iter().any(|e| e == entry)
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.log.lock().unwrap().iter().position(|e| e == entry)
    }

    fn started(&self) {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
    }

    fn stopped(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

/// Behavior of the n-th service the factory builds
#[derive(Clone, Default)]
pub struct ServicePlan {
    pub create_gate: Option<Gate>,
    pub create_delay: Option<Duration>,
    pub fail: bool,
    pub close_gate: Option<Gate>,
    pub close_delay: Option<Duration>,
    pub status_gate: Option<Gate>,
}

pub struct TestingJobMasterService {
    pub index: usize,
    pub context: JobMasterContext,
    plan: ServicePlan,
    probe: Arc<Probe>,
    closed: AtomicBool,
}

impl TestingJobMasterService {
    pub fn finish(&self) -> bool {
        self.context
            .completion
            .job_reached_globally_terminal_state(JobResult::finished(self.context.job_id()))
    }

    pub fn fail_job(&self, reason: &str) -> bool {
        self.context.completion.job_master_failed(reason)
    }
}

#[async_trait]
impl JobMasterService for TestingJobMasterService {
    async fn request_job_status(&self) -> Result<JobStatus> {
        self.probe.record(format!("status:{}", self.index));
        if let Some(gate) = &self.plan.status_gate {
            gate.wait().await;
        }
        Ok(JobStatus::Running)
    }

    async fn cancel(&self) -> Result<()> {
        self.probe.record(format!("cancel:{}", self.index));
        self.context
            .completion
            .job_reached_globally_terminal_state(JobResult::canceled(self.context.job_id()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(gate) = &self.plan.close_gate {
            gate.wait().await;
        }
        if let Some(delay) = self.plan.close_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.probe.stopped();
            self.probe.record(format!("closed:{}", self.index));
        }
        Ok(())
    }
}

/// Builds [`TestingJobMasterService`]s following a queue of plans
#[derive(Default)]
pub struct TestingJobMasterServiceFactory {
    pub probe: Arc<Probe>,
    plans: Mutex<VecDeque<ServicePlan>>,
    services: Mutex<Vec<Arc<TestingJobMasterService>>>,
}

impl TestingJobMasterServiceFactory {
    pub fn new(plans: Vec<ServicePlan>) -> Self {
        Self {
            probe: Arc::new(Probe::default()),
            plans: Mutex::new(plans.into()),
            services: Mutex::new(Vec::new()),
        }
    }

    pub fn service(&self, index: usize) -> Arc<TestingJobMasterService> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.index == index)
            .cloned()
            .unwrap_or_else(|| panic!("service {} was never built", index))
    }

    pub fn services(&self) -> Vec<Arc<TestingJobMasterService>> {
        self.services.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobMasterServiceFactory for TestingJobMasterServiceFactory {
    async fn create_service(&self, context: JobMasterContext) -> Result<Arc<dyn JobMasterService>> {
        let index = self.probe.created.fetch_add(1, Ordering::SeqCst);
        let plan = self.plans.lock().unwrap().pop_front().unwrap_or_default();

        if let Some(gate) = &plan.create_gate {
            gate.wait().await;
        }
        if let Some(delay) = plan.create_delay {
            tokio::time::sleep(delay).await;
        }
        if plan.fail {
            self.probe.record(format!("failed:{}", index));
            return Err(Error::Internal(format!("planned failure of service {}", index)));
        }

        self.probe.started();
        self.probe.record(format!("started:{}", index));
        let service = Arc::new(TestingJobMasterService {
            index,
            context,
            plan,
            probe: self.probe.clone(),
            closed: AtomicBool::new(false),
        });
        self.services.lock().unwrap().push(service.clone());
        Ok(service)
    }
}

#[derive(Default)]
pub struct RecordingFatalErrorHandler {
    errors: Mutex<Vec<String>>,
    initialization_failures: AtomicUsize,
    job_master_failures: AtomicUsize,
}

impl RecordingFatalErrorHandler {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn initialization_failures(&self) -> usize {
        self.initialization_failures.load(Ordering::SeqCst)
    }

    pub fn job_master_failures(&self) -> usize {
        self.job_master_failures.load(Ordering::SeqCst)
    }
}

impl FatalErrorHandler for RecordingFatalErrorHandler {
    fn on_fatal_error(&self, error: &Error) {
        match error {
            Error::InitializationFailed { .. } => {
                self.initialization_failures.fetch_add(1, Ordering::SeqCst);
            }
            Error::JobMasterFailed { .. } => {
                self.job_master_failures.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        self.errors.lock().unwrap().push(error.to_string());
    }
}

/// Worker with a fixed set of partitions per job
pub struct TestingTaskExecutor {
    id: ResourceId,
    hang: bool,
    partitions: Mutex<Vec<(JobId, ResultPartitionId)>>,
    released: Mutex<Vec<ResultPartitionId>>,
}

impl TestingTaskExecutor {
    pub fn new(id: &str) -> Arc<Self> {
        Self::build(id, false)
    }

    pub fn hanging(id: &str) -> Arc<Self> {
        Self::build(id, true)
    }

    fn build(id: &str, hang: bool) -> Arc<Self> {
        Arc::new(Self {
            id: ResourceId::new(id),
            hang,
            partitions: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        })
    }

    pub fn hold(&self, job_id: JobId, partition: ResultPartitionId) {
        self.partitions.lock().unwrap().push((job_id, partition));
    }

    pub fn released(&self) -> Vec<ResultPartitionId> {
        self.released.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutorGateway for TestingTaskExecutor {
    fn resource_id(&self) -> &ResourceId {
        &self.id
    }

    async fn partitions_with_metrics(&self, job_id: JobId) -> Result<Vec<PartitionWithMetrics>> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(self
            .partitions
            .lock()
            .unwrap()
            .iter()
            .filter(|(job, _)| *job == job_id)
            .map(|(_, partition)| PartitionWithMetrics {
                partition: *partition,
                producer: self.id.clone(),
                size_bytes: 512,
                num_subpartitions: 1,
                produced_at: chrono::Utc::now(),
            })
            .collect())
    }

    async fn release_partitions(
        &self,
        _job_id: JobId,
        partitions: Vec<ResultPartitionId>,
    ) -> Result<()> {
        self.released.lock().unwrap().extend(partitions);
        Ok(())
    }
}

/// A runner wired to testing services, a real shuffle master and a static
/// worker directory
pub struct Harness {
    pub job_id: JobId,
    pub runner: LeadershipRunner,
    pub services: Arc<TestingJobMasterServiceFactory>,
    pub probe: Arc<Probe>,
    pub shuffle_master: Arc<ShuffleMaster>,
    pub workers: Arc<StaticWorkerDirectory>,
    pub fatal: Arc<RecordingFatalErrorHandler>,
    pub events: Arc<MemoryEventReporter>,
}

impl Harness {
    pub fn start(plans: Vec<ServicePlan>) -> Self {
        Self::with_config(plans, ShuffleConfig::default())
    }

    pub fn with_config(plans: Vec<ServicePlan>, config: ShuffleConfig) -> Self {
        let services = Arc::new(TestingJobMasterServiceFactory::new(plans));
        let events = Arc::new(MemoryEventReporter::new());
        let shuffle_master = Arc::new(ShuffleMaster::with_events(events.clone()));
        let workers = Arc::new(StaticWorkerDirectory::new());
        let fatal = Arc::new(RecordingFatalErrorHandler::default());

        let definition = JobDefinition::new("testing-job");
        let job_id = definition.job_id;
        let factory = DefaultJobMasterServiceProcessFactory::new(
            definition,
            services.clone(),
            shuffle_master.clone(),
            workers.clone(),
            events.clone(),
            config,
        );
        let runner = LeadershipRunner::start(
            Arc::new(factory),
            RunnerServices {
                fatal_error_handler: fatal.clone(),
                events: events.clone(),
            },
        );

        Self {
            job_id,
            runner,
            probe: services.probe.clone(),
            services,
            shuffle_master,
            workers,
            fatal,
            events,
        }
    }

    pub async fn wait_for_state(&self, expected: RunnerState) {
        wait_for_state(&self.runner, expected).await;
    }
}

pub async fn wait_for_state(runner: &LeadershipRunner, expected: RunnerState) {
    let mut state = runner.subscribe_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("runner never reached {}, still {}", expected, runner.state()))
        .expect("runner state channel closed");
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition never became true");
}

/// Run `fut` with the default test bound.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("operation did not complete in time")
}
