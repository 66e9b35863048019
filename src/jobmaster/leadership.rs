//! Per-job leadership runner
//!
//! A [`LeadershipRunner`] owns at most one live [`JobMasterServiceProcess`]
//! for its job. Grants, revokes, client requests and process lifecycle
//! notifications all go through one mailbox and are handled one at a time by
//! a single actor task, so the state machine itself needs no locking.
//!
//! State transitions:
//!
//! ```text
//! Idle --grant--> AwaitingLeaderGrant --created--> ProcessRunning
//! ProcessRunning --revoke--> AwaitingLeaderConfirmation --terminated--> Idle
//! AwaitingLeaderGrant --revoke--> AwaitingLeaderConfirmation (construction cancelled)
//! any --close--> ... --> Stopped
//! ```
//!
//! A grant that arrives while an outgoing process is still tearing down is
//! held until the teardown settles. Every grant, revoke and close advances
//! the job's [`SessionFence`], so a superseded process is refused the moment
//! the runner moves on, even while it is still shutting down.

use crate::common::{
    Error, EventReporter, JobEvent, JobEventKind, JobId, Result, RunnerMetrics, SessionToken,
    TracingEventReporter,
};
use crate::jobmaster::factory::JobMasterServiceProcessFactory;
use crate::jobmaster::fatal::{FatalErrorHandler, LoggingFatalErrorHandler};
use crate::jobmaster::fencing::{FencingToken, SessionFence, SessionGuard};
use crate::jobmaster::forwarder::{ForwardedRequest, RequestForwarder};
use crate::jobmaster::job::{JobResult, JobStatus, RunnerResult};
use crate::jobmaster::process::{JobMasterServiceProcess, ProcessOutcome};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    ProcessRunning,
    AwaitingLeaderGrant,
    AwaitingLeaderConfirmation,
    Stopped,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerState::Idle => "idle",
            RunnerState::ProcessRunning => "process_running",
            RunnerState::AwaitingLeaderGrant => "awaiting_leader_grant",
            RunnerState::AwaitingLeaderConfirmation => "awaiting_leader_confirmation",
            RunnerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Callbacks the leader election service invokes on a contender
#[async_trait]
pub trait LeaderContender: Send + Sync {
    async fn grant_leadership(&self, session: SessionToken) -> Result<()>;

    async fn revoke_leadership(&self) -> Result<()>;

    /// Errors raised by the election service itself.
    fn handle_error(&self, error: Error);
}

/// Outward-facing collaborators of a runner
#[derive(Clone)]
pub struct RunnerServices {
    pub fatal_error_handler: Arc<dyn FatalErrorHandler>,
    pub events: Arc<dyn EventReporter>,
}

impl Default for RunnerServices {
    fn default() -> Self {
        Self {
            fatal_error_handler: Arc::new(LoggingFatalErrorHandler),
            events: Arc::new(TracingEventReporter),
        }
    }
}

enum Creation {
    Created(Arc<JobMasterServiceProcess>),
    Failed(Error),
    Cancelled,
}

enum ResultReply {
    Ready(JobResult),
    Pending {
        outcome: watch::Receiver<Option<ProcessOutcome>>,
        session: SessionGuard,
    },
}

enum Command {
    Grant {
        session: SessionToken,
        ack: oneshot::Sender<Result<()>>,
    },
    Revoke {
        ack: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<Result<JobStatus>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<()>>,
    },
    AwaitResult {
        reply: oneshot::Sender<Result<ResultReply>>,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
    ProcessCreated {
        generation: u64,
        creation: Creation,
    },
    ProcessTerminated {
        generation: u64,
    },
    ProcessCompleted {
        generation: u64,
        outcome: ProcessOutcome,
    },
}

/// Handle to the runner of one job. Cheap to clone.
///
/// Dropping every handle abandons the runner: the current process is torn
/// down in the background and the actor exits.
#[derive(Clone)]
pub struct LeadershipRunner {
    job_id: JobId,
    mailbox: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<RunnerState>,
    result: watch::Receiver<Option<RunnerResult>>,
    fence: Arc<SessionFence>,
    metrics: Arc<RunnerMetrics>,
    services: RunnerServices,
}

impl LeadershipRunner {
    /// Spawn the runner actor for the factory's job. Must be called from
    /// within a tokio runtime.
    pub fn start(
        factory: Arc<dyn JobMasterServiceProcessFactory>,
        services: RunnerServices,
    ) -> Self {
        let job_id = factory.job_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RunnerState::Idle);
        let (result_tx, result_rx) = watch::channel(None);
        let fence = Arc::new(SessionFence::new(job_id));
        let metrics = Arc::new(RunnerMetrics::default());

        let actor = RunnerActor {
            job_id,
            factory,
            fence: fence.clone(),
            mailbox: tx.downgrade(),
            state: state_tx,
            result: result_tx,
            metrics: metrics.clone(),
            services: services.clone(),
            slot: Slot::Empty,
            settling: 0,
            pending_grant: None,
            closing: false,
            stopped: false,
            close_waiters: Vec::new(),
        };
        tokio::spawn(actor.run(rx));
        tracing::debug!(%job_id, "Started leadership runner");

        Self {
            job_id,
            mailbox: tx,
            state: state_rx,
            result: result_rx,
            fence,
            metrics,
            services,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunnerState> {
        self.state.clone()
    }

    pub fn current_session(&self) -> Option<SessionToken> {
        self.fence.current().map(|t| t.session())
    }

    pub fn metrics(&self) -> &RunnerMetrics {
        &self.metrics
    }

    /// Result settled so far, if any.
    pub fn try_result(&self) -> Option<RunnerResult> {
        self.result.borrow().clone()
    }

    /// Wait for the runner result: success when the job finished under the
    /// current leader, `NotFinished` when the runner closed first.
    pub async fn result(&self) -> RunnerResult {
        let mut rx = self.result.clone();
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        };
        settled.unwrap_or(RunnerResult::NotFinished)
    }

    pub async fn grant_leadership(&self, session: SessionToken) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Grant { session, ack })?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn revoke_leadership(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Revoke { ack })?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn request_job_status(&self) -> Result<JobStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn cancel_job(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { reply })?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Result of the job under the current leader.
    ///
    /// Fails with not-leader if no process is current, or if the process is
    /// torn down before the job finishes.
    pub async fn request_job_result(&self) -> Result<JobResult> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AwaitResult { reply })?;
        match rx.await.map_err(|_| self.closed())?? {
            ResultReply::Ready(result) => Ok(result),
            ResultReply::Pending {
                mut outcome,
                session,
            } => {
                let settled = match outcome.wait_for(Option::is_some).await {
                    Ok(o) => o.clone(),
                    Err(_) => None,
                };
                // a superseded process may still settle; its outcome is not ours to report
                if session.check().is_err() {
                    return Err(Error::NotLeader {
                        job_id: self.job_id,
                    });
                }
                match settled {
                    Some(ProcessOutcome::Finished(result)) => Ok(result),
                    Some(ProcessOutcome::Failed(reason)) => Err(Error::JobMasterFailed {
                        job_id: self.job_id,
                        reason,
                    }),
                    Some(ProcessOutcome::NotFinished) | None => Err(Error::NotLeader {
                        job_id: self.job_id,
                    }),
                }
            }
        }
    }

    /// Revoke, wait for any teardown in flight, then stop. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        if self.send(Command::Close { ack }).is_err() {
            return Ok(());
        }
        // a dropped ack means another close already stopped the runner
        let _ = rx.await;
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.mailbox.send(command).map_err(|_| self.closed())
    }

    fn closed(&self) -> Error {
        Error::RunnerClosed(self.job_id)
    }
}

#[async_trait]
impl LeaderContender for LeadershipRunner {
    async fn grant_leadership(&self, session: SessionToken) -> Result<()> {
        LeadershipRunner::grant_leadership(self, session).await
    }

    async fn revoke_leadership(&self) -> Result<()> {
        LeadershipRunner::revoke_leadership(self).await
    }

    fn handle_error(&self, error: Error) {
        tracing::error!(job_id = %self.job_id, error = %error, "Leader election failed");
        self.services.fatal_error_handler.on_fatal_error(&error);
    }
}

enum Slot {
    Empty,
    Creating {
        token: FencingToken,
        cancel: oneshot::Sender<()>,
    },
    Running {
        token: FencingToken,
        forwarder: RequestForwarder,
    },
}

struct RunnerActor {
    job_id: JobId,
    factory: Arc<dyn JobMasterServiceProcessFactory>,
    fence: Arc<SessionFence>,
    mailbox: mpsc::WeakUnboundedSender<Command>,
    state: watch::Sender<RunnerState>,
    result: watch::Sender<Option<RunnerResult>>,
    metrics: Arc<RunnerMetrics>,
    services: RunnerServices,
    slot: Slot,
    /// Superseded constructions and teardowns not yet settled
    settling: usize,
    pending_grant: Option<FencingToken>,
    closing: bool,
    stopped: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
}

impl RunnerActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
            if self.stopped {
                break;
            }
        }
        if !self.stopped {
            self.abandon();
        }
        tracing::debug!(job_id = %self.job_id, "Leadership runner exited");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Grant { session, ack } => {
                let result = self.grant(session);
                let _ = ack.send(result);
            }
            Command::Revoke { ack } => {
                self.revoke();
                let _ = ack.send(());
            }
            Command::Status { reply } => match &self.slot {
                Slot::Running { forwarder, .. } => {
                    forwarder.forward(ForwardedRequest::Status(reply))
                }
                _ => {
                    let _ = reply.send(Err(self.rejection()));
                }
            },
            Command::Cancel { reply } => match &self.slot {
                Slot::Running { forwarder, .. } => {
                    forwarder.forward(ForwardedRequest::Cancel(reply))
                }
                _ => {
                    let _ = reply.send(Err(self.rejection()));
                }
            },
            Command::AwaitResult { reply } => {
                let _ = reply.send(self.await_result());
            }
            Command::Close { ack } => self.close(ack),
            Command::ProcessCreated {
                generation,
                creation,
            } => self.on_created(generation, creation),
            Command::ProcessTerminated { generation } => self.on_terminated(generation),
            Command::ProcessCompleted {
                generation,
                outcome,
            } => self.on_completed(generation, outcome),
        }
    }

    fn grant(&mut self, session: SessionToken) -> Result<()> {
        if self.closing {
            return Err(Error::RunnerClosed(self.job_id));
        }
        if self.fence.current().map(|t| t.session()) == Some(session) {
            tracing::debug!(job_id = %self.job_id, %session, "Leadership already granted for session");
            return Ok(());
        }

        let token = self.fence.grant(session);
        self.metrics.grants.inc();
        tracing::info!(job_id = %self.job_id, %session, generation = token.generation(), "Leadership granted");
        self.report(
            JobEvent::new(self.job_id, JobEventKind::LeadershipGranted, "leadership granted")
                .with_session(session)
                .with_attributes(json!({ "generation": token.generation() })),
        );

        self.retire_current();
        self.pending_grant = Some(token);
        self.try_settle();
        Ok(())
    }

    fn revoke(&mut self) {
        if self.fence.current().is_none() {
            tracing::debug!(job_id = %self.job_id, "No leadership to revoke");
            return;
        }

        self.fence.revoke();
        self.metrics.revokes.inc();
        tracing::info!(job_id = %self.job_id, generation = self.fence.generation(), "Leadership revoked");
        self.report(JobEvent::new(
            self.job_id,
            JobEventKind::LeadershipRevoked,
            "leadership revoked",
        ));

        self.pending_grant = None;
        self.retire_current();
        self.publish_state();
    }

    fn close(&mut self, ack: oneshot::Sender<()>) {
        self.close_waiters.push(ack);
        if !self.closing {
            self.closing = true;
            self.fence.revoke();
            self.pending_grant = None;
            tracing::info!(job_id = %self.job_id, "Closing leadership runner");
            self.retire_current();
        }
        self.try_settle();
    }

    fn rejection(&self) -> Error {
        if self.closing {
            Error::RunnerClosed(self.job_id)
        } else {
            Error::NotLeader {
                job_id: self.job_id,
            }
        }
    }

    fn await_result(&self) -> Result<ResultReply> {
        if let Some(RunnerResult::Success(result)) = &*self.result.borrow() {
            return Ok(ResultReply::Ready(result.clone()));
        }
        match &self.slot {
            Slot::Running { forwarder, .. } => {
                let process = forwarder.process();
                Ok(ResultReply::Pending {
                    outcome: process.subscribe_outcome(),
                    session: process.session().clone(),
                })
            }
            _ => Err(self.rejection()),
        }
    }

    /// Stop whatever the slot holds: cancel a construction or tear down a
    /// running process. Either way the runner waits for it to settle.
    fn retire_current(&mut self) {
        match std::mem::replace(&mut self.slot, Slot::Empty) {
            Slot::Empty => {}
            Slot::Creating { token, cancel } => {
                tracing::debug!(job_id = %self.job_id, generation = token.generation(), "Cancelling job master construction");
                let _ = cancel.send(());
                self.settling += 1;
            }
            Slot::Running { token, forwarder } => {
                self.metrics.running_processes.dec();
                let process = forwarder.process().clone();
                drop(forwarder);
                self.begin_teardown(token.generation(), process);
            }
        }
    }

    fn begin_teardown(&mut self, generation: u64, process: Arc<JobMasterServiceProcess>) {
        self.settling += 1;
        tracing::info!(job_id = %self.job_id, session = %process.session_token(), generation, "Stopping job master process");
        self.report(
            JobEvent::new(self.job_id, JobEventKind::ProcessStopping, "stopping job master")
                .with_session(process.session_token()),
        );

        let mailbox = self.mailbox.upgrade();
        tokio::spawn(async move {
            process.close().await;
            if let Some(mailbox) = mailbox {
                let _ = mailbox.send(Command::ProcessTerminated { generation });
            }
        });
    }

    fn try_settle(&mut self) {
        if self.settling == 0 && matches!(self.slot, Slot::Empty) {
            if self.closing {
                self.finish_close();
                return;
            }
            if let Some(token) = self.pending_grant.take() {
                if self.fence.is_current(&token) {
                    self.start_creation(token);
                }
            }
        }
        self.publish_state();
    }

    fn start_creation(&mut self, token: FencingToken) {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let factory = self.factory.clone();
        let guard = SessionGuard::new(token, self.fence.clone());
        let mailbox = self.mailbox.upgrade();
        let generation = token.generation();
        tracing::debug!(job_id = %self.job_id, session = %token.session(), generation, "Creating job master process");

        tokio::spawn(async move {
            let creation = tokio::select! {
                created = factory.create(guard) => match created {
                    Ok(process) => Creation::Created(process),
                    Err(e) => Creation::Failed(e),
                },
                _ = cancel_rx => Creation::Cancelled,
            };
            let orphan = match mailbox {
                Some(mailbox) => match mailbox.send(Command::ProcessCreated {
                    generation,
                    creation,
                }) {
                    Ok(()) => None,
                    Err(mpsc::error::SendError(Command::ProcessCreated {
                        creation: Creation::Created(process),
                        ..
                    })) => Some(process),
                    Err(_) => None,
                },
                None => match creation {
                    Creation::Created(process) => Some(process),
                    _ => None,
                },
            };
            // runner is gone; nobody else will close it
            if let Some(process) = orphan {
                process.close().await;
            }
        });

        self.slot = Slot::Creating {
            token,
            cancel: cancel_tx,
        };
    }

    fn on_created(&mut self, generation: u64, creation: Creation) {
        let current = match &self.slot {
            Slot::Creating { token, .. } if token.generation() == generation => Some(*token),
            _ => None,
        };

        let Some(token) = current else {
            // superseded while constructing
            self.settling = self.settling.saturating_sub(1);
            match creation {
                Creation::Created(process) => {
                    self.metrics.stale_rejections.inc();
                    tracing::info!(job_id = %self.job_id, generation, "Discarding job master built for a superseded session");
                    self.begin_teardown(generation, process);
                }
                Creation::Failed(e) => {
                    tracing::debug!(job_id = %self.job_id, generation, error = %e, "Superseded job master construction failed");
                }
                Creation::Cancelled => {
                    tracing::debug!(job_id = %self.job_id, generation, "Job master construction cancelled");
                }
            }
            self.try_settle();
            return;
        };

        self.slot = Slot::Empty;
        match creation {
            Creation::Created(process) => {
                self.metrics.processes_started.inc();
                self.metrics.running_processes.inc();
                tracing::info!(job_id = %self.job_id, session = %token.session(), generation, "Job master process running");
                self.report(
                    JobEvent::new(self.job_id, JobEventKind::ProcessStarted, "job master running")
                        .with_session(token.session()),
                );
                self.watch_completion(generation, &process);
                self.slot = Slot::Running {
                    token,
                    forwarder: RequestForwarder::spawn(process),
                };
            }
            Creation::Failed(e) => {
                self.metrics.initialization_failures.inc();
                tracing::error!(job_id = %self.job_id, session = %token.session(), error = %e, "Job master initialization failed");
                self.report(
                    JobEvent::new(
                        self.job_id,
                        JobEventKind::InitializationFailed,
                        e.to_string(),
                    )
                    .with_session(token.session()),
                );
                let error = match e {
                    Error::InitializationFailed { .. } => e,
                    other => Error::InitializationFailed {
                        job_id: self.job_id,
                        reason: other.to_string(),
                    },
                };
                self.services.fatal_error_handler.on_fatal_error(&error);
            }
            Creation::Cancelled => {
                tracing::warn!(job_id = %self.job_id, generation, "Current job master construction reported cancelled");
            }
        }
        self.publish_state();
    }

    fn on_terminated(&mut self, generation: u64) {
        self.settling = self.settling.saturating_sub(1);
        self.metrics.processes_stopped.inc();
        tracing::info!(job_id = %self.job_id, generation, "Job master process terminated");
        self.report(JobEvent::new(
            self.job_id,
            JobEventKind::ProcessTerminated,
            "job master terminated",
        ));
        self.try_settle();
    }

    fn on_completed(&mut self, generation: u64, outcome: ProcessOutcome) {
        if outcome == ProcessOutcome::NotFinished {
            return;
        }
        let current = matches!(
            &self.slot,
            Slot::Running { token, .. } if token.generation() == generation
        );
        if !current {
            self.metrics.stale_rejections.inc();
            tracing::debug!(job_id = %self.job_id, generation, "Ignoring completion of a superseded job master");
            return;
        }

        match outcome {
            ProcessOutcome::Finished(result) => {
                tracing::info!(job_id = %self.job_id, status = %result.status, "Job reached a globally terminal state");
                self.report(JobEvent::new(
                    self.job_id,
                    JobEventKind::JobFinished,
                    format!("job {}", result.status),
                ));
                self.result.send_if_modified(|slot| {
                    if slot.is_none() {
                        *slot = Some(RunnerResult::Success(result));
                        true
                    } else {
                        false
                    }
                });
            }
            ProcessOutcome::Failed(reason) => {
                tracing::error!(job_id = %self.job_id, reason = %reason, "Job master failed");
                self.report(JobEvent::new(
                    self.job_id,
                    JobEventKind::JobMasterFailed,
                    reason.clone(),
                ));
                self.services
                    .fatal_error_handler
                    .on_fatal_error(&Error::JobMasterFailed {
                        job_id: self.job_id,
                        reason,
                    });
            }
            ProcessOutcome::NotFinished => {}
        }
    }

    fn watch_completion(&self, generation: u64, process: &JobMasterServiceProcess) {
        let mut outcome = process.subscribe_outcome();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let settled = match outcome.wait_for(Option::is_some).await {
                Ok(o) => o.clone(),
                Err(_) => None,
            };
            if let (Some(outcome), Some(mailbox)) = (settled, mailbox.upgrade()) {
                let _ = mailbox.send(Command::ProcessCompleted {
                    generation,
                    outcome,
                });
            }
        });
    }

    fn finish_close(&mut self) {
        self.result.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(RunnerResult::NotFinished);
                true
            } else {
                false
            }
        });
        self.stopped = true;
        self.publish_state();
        tracing::info!(job_id = %self.job_id, "Leadership runner stopped");
        self.report(JobEvent::new(
            self.job_id,
            JobEventKind::RunnerClosed,
            "runner closed",
        ));
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn abandon(&mut self) {
        tracing::warn!(job_id = %self.job_id, "All runner handles dropped, tearing down");
        self.fence.revoke();
        self.pending_grant = None;
        self.retire_current();
        self.result.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(RunnerResult::NotFinished);
                true
            } else {
                false
            }
        });
    }

    fn state_now(&self) -> RunnerState {
        if self.stopped {
            return RunnerState::Stopped;
        }
        match self.slot {
            Slot::Running { .. } => RunnerState::ProcessRunning,
            Slot::Creating { .. } => RunnerState::AwaitingLeaderGrant,
            Slot::Empty if self.settling > 0 => RunnerState::AwaitingLeaderConfirmation,
            Slot::Empty => RunnerState::Idle,
        }
    }

    fn publish_state(&self) {
        let next = self.state_now();
        self.state.send_if_modified(|state| {
            if *state != next {
                tracing::debug!(job_id = %self.job_id, from = %state, to = %next, "Runner state changed");
                *state = next;
                true
            } else {
                false
            }
        });
    }

    fn report(&self, event: JobEvent) {
        self.services.events.notify_of_added_event(&event);
    }
}
