//! Simulator binary
//!
//! Runs a handful of jobs against simulated workers and drives random
//! leadership churn, worker loss and metrics queries through them.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use jobmaster_core::common::{
    parse_duration, Config, EventReporter, JobEvent, JobEventKind, JobId, MemoryEventReporter,
    ResourceId, Result, ResultPartitionId, SessionToken, TracingEventReporter,
};
use jobmaster_core::jobmaster::{
    DefaultJobMasterServiceProcessFactory, JobDefinition, JobMasterContext, JobMasterService,
    JobMasterServiceFactory, JobResult, JobRunnerRegistry, JobStatus, LeaderContender,
    LeadershipRunner, LoggingFatalErrorHandler, RunnerServices,
};
use jobmaster_core::shuffle::{
    PartitionWithMetrics, ShuffleMaster, StaticWorkerDirectory, TaskExecutorGateway,
    TrackedPartition,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "jobmaster-sim")]
#[command(about = "Leadership churn simulator for the job master core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation
    Run {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of jobs
        #[arg(long, default_value = "3")]
        jobs: usize,

        /// Number of simulated workers
        #[arg(long, default_value = "4")]
        workers: usize,

        /// Churn rounds
        #[arg(long, default_value = "40")]
        rounds: usize,

        /// RNG seed
        #[arg(long, default_value = "7")]
        seed: u64,

        /// Partitions a job produces before it finishes
        #[arg(long, default_value = "25")]
        partitions: usize,

        /// Per-worker bound for metrics queries (e.g. 200ms), overrides config
        #[arg(long)]
        metrics_timeout: Option<String>,
    },
}

/// Worker holding partitions in memory
struct SimWorker {
    id: ResourceId,
    delay: Duration,
    partitions: Mutex<HashMap<JobId, Vec<ResultPartitionId>>>,
}

impl SimWorker {
    fn new(id: impl Into<String>, delay: Duration) -> Self {
        Self {
            id: ResourceId::new(id),
            delay,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    fn store(&self, job_id: JobId, partition: ResultPartitionId) {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_id)
            .or_default()
            .push(partition);
    }

    /// Simulated crash: every partition is gone.
    fn wipe(&self) {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl TaskExecutorGateway for SimWorker {
    fn resource_id(&self) -> &ResourceId {
        &self.id
    }

    async fn partitions_with_metrics(&self, job_id: JobId) -> Result<Vec<PartitionWithMetrics>> {
        tokio::time::sleep(self.delay).await;
        let partitions = self
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        Ok(partitions
            .into_iter()
            .map(|partition| PartitionWithMetrics {
                partition,
                producer: self.id.clone(),
                size_bytes: 4096,
                num_subpartitions: 8,
                produced_at: chrono::Utc::now(),
            })
            .collect())
    }

    async fn release_partitions(
        &self,
        job_id: JobId,
        partitions: Vec<ResultPartitionId>,
    ) -> Result<()> {
        if let Some(held) = self
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&job_id)
        {
            held.retain(|p| !partitions.contains(p));
        }
        Ok(())
    }
}

/// Coordinator logic that keeps producing partitions until it has enough
struct SimJobMaster {
    stop: watch::Sender<bool>,
}

#[async_trait]
impl JobMasterService for SimJobMaster {
    async fn request_job_status(&self) -> Result<JobStatus> {
        Ok(JobStatus::Running)
    }

    async fn cancel(&self) -> Result<()> {
        self.stop.send_replace(true);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stop.send_replace(true);
        Ok(())
    }
}

struct SimJobMasterFactory {
    workers: Vec<Arc<SimWorker>>,
    partitions: usize,
    produce_every: Duration,
}

#[async_trait]
impl JobMasterServiceFactory for SimJobMasterFactory {
    async fn create_service(&self, context: JobMasterContext) -> Result<Arc<dyn JobMasterService>> {
        let (stop, mut stopped) = watch::channel(false);
        let workers = self.workers.clone();
        let target = self.partitions;
        let mut tick = tokio::time::interval(self.produce_every);

        tokio::spawn(async move {
            let job_id = context.job_id();
            let mut produced = 0usize;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = tick.tick() => {}
                }
                // lost partitions have to be produced again
                produced = produced.saturating_sub(context.lost_partitions.drain().len());

                let worker = &workers[produced % workers.len()];
                let id = ResultPartitionId::new();
                if !context.partition_produced(TrackedPartition::new(id, worker.id.clone())) {
                    break;
                }
                worker.store(job_id, id);
                produced += 1;

                if produced >= target {
                    context
                        .completion
                        .job_reached_globally_terminal_state(JobResult::finished(job_id));
                    break;
                }
            }
        });

        Ok(Arc::new(SimJobMaster { stop }))
    }
}

/// Logs every event and keeps a copy for the summary
struct SimEventReporter {
    log: TracingEventReporter,
    memory: Arc<MemoryEventReporter>,
}

impl EventReporter for SimEventReporter {
    fn notify_of_added_event(&self, event: &JobEvent) {
        self.log.notify_of_added_event(event);
        self.memory.notify_of_added_event(event);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            jobs,
            workers,
            rounds,
            seed,
            partitions,
            metrics_timeout,
        } => {
            // Load config from file, then override with CLI arguments
            let mut config = Config::load(config.as_deref())?;
            if let Some(timeout) = metrics_timeout {
                config.shuffle.metrics_query_timeout_ms = parse_duration(&timeout)?.as_millis() as u64;
                config.validate()?;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            run(config, jobs.max(1), workers.max(1), rounds, seed, partitions.max(1)).await?;
        }
    }

    Ok(())
}

async fn run(
    config: Config,
    jobs: usize,
    worker_count: usize,
    rounds: usize,
    seed: u64,
    partitions: usize,
) -> anyhow::Result<()> {
    tracing::info!(node_id = %config.node_id, jobs, workers = worker_count, rounds, seed, "Starting simulation");
    let mut rng = StdRng::seed_from_u64(seed);

    let timeout = config.shuffle.metrics_query_timeout();
    let directory = Arc::new(StaticWorkerDirectory::new());
    let mut sim_workers = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
        // the last worker answers metrics queries too late
        let delay = if i + 1 == worker_count && worker_count > 1 {
            timeout * 2
        } else {
            Duration::from_millis(5)
        };
        let worker = Arc::new(SimWorker::new(format!("tm-{}", i + 1), delay));
        directory.register(worker.clone());
        sim_workers.push(worker);
    }

    let memory = Arc::new(MemoryEventReporter::new());
    let events: Arc<dyn EventReporter> = Arc::new(SimEventReporter {
        log: TracingEventReporter,
        memory: memory.clone(),
    });
    let registry = JobRunnerRegistry::new(RunnerServices {
        fatal_error_handler: Arc::new(LoggingFatalErrorHandler),
        events: events.clone(),
    });
    let shuffle_master = Arc::new(ShuffleMaster::with_events(events.clone()));
    let services = Arc::new(SimJobMasterFactory {
        workers: sim_workers.clone(),
        partitions,
        produce_every: Duration::from_millis(10),
    });

    let mut runners: Vec<LeadershipRunner> = Vec::with_capacity(jobs);
    for i in 0..jobs {
        let factory = DefaultJobMasterServiceProcessFactory::new(
            JobDefinition::new(format!("job-{}", i + 1)),
            services.clone(),
            shuffle_master.clone(),
            directory.clone(),
            events.clone(),
            config.shuffle.clone(),
        );
        runners.push(registry.submit(Arc::new(factory))?);
    }

    for round in 0..rounds {
        let runner = &runners[rng.gen_range(0..runners.len())];
        let contender: &dyn LeaderContender = runner;
        match rng.gen_range(0..10) {
            0..=3 => {
                let session = SessionToken::new();
                tracing::debug!(round, job_id = %runner.job_id(), %session, "Granting leadership");
                if let Err(e) = contender.grant_leadership(session).await {
                    tracing::warn!(round, error = %e, "Grant rejected");
                }
            }
            4..=5 => {
                tracing::debug!(round, job_id = %runner.job_id(), "Revoking leadership");
                contender.revoke_leadership().await?;
            }
            6 => {
                let worker = &sim_workers[rng.gen_range(0..sim_workers.len())];
                worker.wipe();
                let report = shuffle_master.notify_worker_lost(worker.resource_id()).await;
                tracing::debug!(round, worker = %worker.resource_id(), partitions = report.partitions, "Worker lost");
            }
            7 => match shuffle_master.partition_metrics(runner.job_id()).await {
                Some(Ok(report)) => tracing::info!(
                    round,
                    job_id = %runner.job_id(),
                    partitions = report.partitions.len(),
                    bytes = report.total_bytes(),
                    complete = report.is_complete(),
                    "Partition metrics"
                ),
                Some(Err(e)) => tracing::info!(round, error = %e, "Metrics query rejected"),
                None => tracing::debug!(round, job_id = %runner.job_id(), "Job has no shuffle context"),
            },
            _ => match runner.request_job_status().await {
                Ok(status) => tracing::info!(round, job_id = %runner.job_id(), %status, "Job status"),
                Err(e) => tracing::info!(round, job_id = %runner.job_id(), error = %e, "Status rejected"),
            },
        }
        tokio::time::sleep(Duration::from_millis(rng.gen_range(1..20))).await;
    }

    registry.close().await?;

    let per_job: Vec<serde_json::Value> = runners
        .iter()
        .map(|r| {
            json!({
                "job_id": r.job_id().to_string(),
                "state": r.state(),
                "finished": matches!(r.try_result(), Some(jobmaster_core::jobmaster::RunnerResult::Success(_))),
                "metrics": r.metrics().to_json(),
            })
        })
        .collect();
    let summary = json!({
        "jobs": per_job,
        "events": {
            "granted": memory.count(JobEventKind::LeadershipGranted),
            "revoked": memory.count(JobEventKind::LeadershipRevoked),
            "processes_started": memory.count(JobEventKind::ProcessStarted),
            "processes_terminated": memory.count(JobEventKind::ProcessTerminated),
            "partitions_released": memory.count(JobEventKind::PartitionsReleased),
            "incomplete_metrics": memory.count(JobEventKind::PartitionMetricsIncomplete),
            "worker_lost": memory.count(JobEventKind::WorkerLost),
            "jobs_finished": memory.count(JobEventKind::JobFinished),
        },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
