//! Error types for jobmaster-core

use crate::common::ids::{JobId, ResourceId, SessionToken};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Leadership Errors ===
    #[error("Not leader: no job master is current for job {job_id}")]
    NotLeader { job_id: JobId },

    #[error("Stale leadership session {session} for job {job_id}")]
    StaleSession { job_id: JobId, session: SessionToken },

    #[error("Leadership runner for job {0} is closed")]
    RunnerClosed(JobId),

    #[error("Job master initialization failed for job {job_id}: {reason}")]
    InitializationFailed { job_id: JobId, reason: String },

    #[error("Job master for job {job_id} failed: {reason}")]
    JobMasterFailed { job_id: JobId, reason: String },

    // === Shuffle Errors ===
    #[error("Shuffle context for job {0} is no longer available")]
    ShuffleContextUnavailable(JobId),

    #[error("Worker {worker} unreachable: {reason}")]
    WorkerUnreachable { worker: ResourceId, reason: String },

    // === Registry Errors ===
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job already submitted: {0}")]
    DuplicateJob(JobId),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Leadership rejections are transient: the caller is expected to retry
    /// once a new leader has been elected.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. }
                | Error::StaleSession { .. }
                | Error::ShuffleContextUnavailable(_)
                | Error::WorkerUnreachable { .. }
                | Error::Timeout(_)
        )
    }

    /// Rejections a client sees when no current leader can serve the call.
    pub fn is_not_leader_or_closed(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. }
                | Error::StaleSession { .. }
                | Error::RunnerClosed(_)
                | Error::ShuffleContextUnavailable(_)
        )
    }

    /// Errors that must be escalated to the fatal-error path.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InitializationFailed { .. } | Error::JobMasterFailed { .. }
        )
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
