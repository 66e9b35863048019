//! Job-level types exchanged with clients

use crate::common::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable description of a submitted job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub job_id: JobId,
    pub name: String,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            job_id: JobId::new(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Initializing,
    Created,
    Running,
    Failing,
    Cancelling,
    Canceled,
    Finished,
    Failed,
    Restarting,
    Suspended,
}

impl JobStatus {
    /// Terminal for the whole cluster: the job will not run again.
    pub fn is_globally_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Canceled | JobStatus::Finished | JobStatus::Failed
        )
    }

    /// Terminal for this job master only (includes suspension on leadership loss).
    pub fn is_terminal(&self) -> bool {
        self.is_globally_terminal() || matches!(self, JobStatus::Suspended)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Initializing => "initializing",
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Failing => "failing",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Canceled => "canceled",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Restarting => "restarting",
            JobStatus::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// Final result of a job that reached a globally terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn finished(job_id: JobId) -> Self {
        Self::with_status(job_id, JobStatus::Finished, None)
    }

    pub fn failed(job_id: JobId, cause: impl Into<String>) -> Self {
        Self::with_status(job_id, JobStatus::Failed, Some(cause.into()))
    }

    pub fn canceled(job_id: JobId) -> Self {
        Self::with_status(job_id, JobStatus::Canceled, None)
    }

    fn with_status(job_id: JobId, status: JobStatus, failure: Option<String>) -> Self {
        Self {
            job_id,
            status,
            failure,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Finished
    }
}

/// What a leadership runner settles with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerResult {
    /// The current job master reported a globally terminal job state.
    Success(JobResult),
    /// The runner was closed before the job finished.
    NotFinished,
}
