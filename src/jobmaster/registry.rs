//! Job-facing entry point: one leadership runner per submitted job

use crate::common::{Error, JobId, Result};
use crate::jobmaster::factory::JobMasterServiceProcessFactory;
use crate::jobmaster::job::{JobResult, JobStatus};
use crate::jobmaster::leadership::{LeadershipRunner, RunnerServices};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

pub struct JobRunnerRegistry {
    runners: RwLock<HashMap<JobId, LeadershipRunner>>,
    services: RunnerServices,
}

impl JobRunnerRegistry {
    pub fn new(services: RunnerServices) -> Self {
        Self {
            runners: RwLock::new(HashMap::new()),
            services,
        }
    }

    /// Start a runner for the factory's job. The runner waits for a grant
    /// before building anything.
    pub fn submit(&self, factory: Arc<dyn JobMasterServiceProcessFactory>) -> Result<LeadershipRunner> {
        let job_id = factory.job_id();
        let mut runners = self.runners.write().unwrap_or_else(PoisonError::into_inner);
        if runners.contains_key(&job_id) {
            return Err(Error::DuplicateJob(job_id));
        }
        let runner = LeadershipRunner::start(factory, self.services.clone());
        runners.insert(job_id, runner.clone());
        tracing::info!(%job_id, "Job submitted");
        Ok(runner)
    }

    pub fn runner(&self, job_id: JobId) -> Result<LeadershipRunner> {
        self.runners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
            .ok_or(Error::JobNotFound(job_id))
    }

    pub fn jobs(&self) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = self
            .runners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        jobs.sort();
        jobs
    }

    pub async fn request_job_status(&self, job_id: JobId) -> Result<JobStatus> {
        self.runner(job_id)?.request_job_status().await
    }

    pub async fn request_job_result(&self, job_id: JobId) -> Result<JobResult> {
        self.runner(job_id)?.request_job_result().await
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        self.runner(job_id)?.cancel_job().await
    }

    /// Close the job's runner and forget it.
    pub async fn remove(&self, job_id: JobId) -> Result<()> {
        let runner = self.runner(job_id)?;
        runner.close().await?;
        self.runners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
        tracing::info!(%job_id, "Job removed");
        Ok(())
    }

    /// Close every runner concurrently.
    pub async fn close(&self) -> Result<()> {
        let runners: Vec<LeadershipRunner> = self
            .runners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, runner)| runner)
            .collect();
        let count = runners.len();
        for result in join_all(runners.iter().map(|r| r.close())).await {
            result?;
        }
        tracing::info!(jobs = count, "Closed all job runners");
        Ok(())
    }
}
