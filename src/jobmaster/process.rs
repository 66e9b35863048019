//! One running job master, bound to one leadership session
//!
//! A [`JobMasterServiceProcess`] wraps the coordinator logic of a job for
//! exactly one session. It owns:
//! - a termination signal, set exactly once when teardown has finished
//! - the handle requests are forwarded to (refused once teardown begins or
//!   the session is superseded)
//! - the outcome the coordinator settles through its [`CompletionHandle`]
//! - the shuffle context it registered with the shuffle master

use crate::common::{Error, JobId, Result, SessionToken};
use crate::jobmaster::fencing::{FencingToken, SessionGuard};
use crate::jobmaster::job::{JobResult, JobStatus};
use crate::shuffle::context::ShuffleContextBridge;
use crate::shuffle::master::{ShuffleMaster, ShuffleRegistration};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// The per-job coordinator logic a process runs
#[async_trait]
pub trait JobMasterService: Send + Sync {
    async fn request_job_status(&self) -> Result<JobStatus>;

    async fn cancel(&self) -> Result<()>;

    /// Stop the coordinator. Called once, when the process tears down.
    async fn close(&self) -> Result<()>;
}

/// How a process ended, from the runner's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The job reached a globally terminal state.
    Finished(JobResult),
    /// The coordinator failed and cannot continue.
    Failed(String),
    /// The process was torn down before the job finished.
    NotFinished,
}

/// Completion callbacks handed to the coordinator logic.
///
/// The first settlement wins; later calls return `false`.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    job_id: JobId,
    tx: Arc<watch::Sender<Option<ProcessOutcome>>>,
}

impl CompletionHandle {
    pub fn new(job_id: JobId) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            job_id,
            tx: Arc::new(tx),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ProcessOutcome>> {
        self.tx.subscribe()
    }

    pub fn outcome(&self) -> Option<ProcessOutcome> {
        self.tx.borrow().clone()
    }

    pub fn job_reached_globally_terminal_state(&self, result: JobResult) -> bool {
        if !result.status.is_globally_terminal() {
            tracing::warn!(job_id = %self.job_id, status = %result.status, "Ignoring completion with non-terminal job status");
            return false;
        }
        self.settle(ProcessOutcome::Finished(result))
    }

    pub fn job_master_failed(&self, reason: impl Into<String>) -> bool {
        self.settle(ProcessOutcome::Failed(reason.into()))
    }

    pub(crate) fn settle(&self, outcome: ProcessOutcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }
}

/// Registration of a process's shuffle context with the shuffle master
pub struct ShuffleBinding {
    pub bridge: Arc<ShuffleContextBridge>,
    pub master: Arc<ShuffleMaster>,
    pub registration: ShuffleRegistration,
}

pub struct JobMasterServiceProcess {
    session: SessionGuard,
    service: Arc<dyn JobMasterService>,
    completion: CompletionHandle,
    shuffle: Option<ShuffleBinding>,
    closing: AtomicBool,
    terminated: watch::Sender<bool>,
}

impl JobMasterServiceProcess {
    pub fn new(
        session: SessionGuard,
        service: Arc<dyn JobMasterService>,
        completion: CompletionHandle,
        shuffle: Option<ShuffleBinding>,
    ) -> Self {
        let (terminated, _) = watch::channel(false);
        Self {
            session,
            service,
            completion,
            shuffle,
            closing: AtomicBool::new(false),
            terminated,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.session.job_id()
    }

    pub fn session_token(&self) -> SessionToken {
        self.session.session()
    }

    pub fn fencing_token(&self) -> FencingToken {
        self.session.token()
    }

    pub fn session(&self) -> &SessionGuard {
        &self.session
    }

    pub fn shuffle_context(&self) -> Option<&Arc<ShuffleContextBridge>> {
        self.shuffle.as_ref().map(|s| &s.bridge)
    }

    /// Running: not tearing down and still bound to the current session.
    pub fn is_running(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && self.session.is_valid()
    }

    /// The coordinator to forward a request to.
    pub fn service(&self) -> Result<Arc<dyn JobMasterService>> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::NotLeader {
                job_id: self.job_id(),
            });
        }
        self.session.check()?;
        Ok(self.service.clone())
    }

    pub fn outcome(&self) -> Option<ProcessOutcome> {
        self.completion.outcome()
    }

    pub fn subscribe_outcome(&self) -> watch::Receiver<Option<ProcessOutcome>> {
        self.completion.subscribe()
    }

    pub fn subscribe_termination(&self) -> watch::Receiver<bool> {
        self.terminated.subscribe()
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    /// Resolves once teardown has finished.
    pub async fn terminated(&self) {
        let mut rx = self.terminated.subscribe();
        // sender lives as long as self
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Tear the process down. Idempotent; every caller returns once the
    /// termination signal is set.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            self.terminated().await;
            return;
        }

        let job_id = self.job_id();
        tracing::debug!(%job_id, session = %self.session_token(), "Closing job master process");

        if let Some(shuffle) = &self.shuffle {
            shuffle.bridge.close();
        }
        if let Err(e) = self.service.close().await {
            tracing::warn!(%job_id, error = %e, "Job master service did not close cleanly");
        }
        if let Some(shuffle) = &self.shuffle {
            shuffle.master.unregister_job(job_id, shuffle.registration);
        }
        self.completion.settle(ProcessOutcome::NotFinished);

        self.terminated.send_replace(true);
        tracing::debug!(%job_id, session = %self.session_token(), "Job master process terminated");
    }
}
