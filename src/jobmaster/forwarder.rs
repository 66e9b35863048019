//! In-order delivery of client requests to one process

use crate::common::{Error, Result};
use crate::jobmaster::job::JobStatus;
use crate::jobmaster::process::JobMasterServiceProcess;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub(crate) enum ForwardedRequest {
    Status(oneshot::Sender<Result<JobStatus>>),
    Cancel(oneshot::Sender<Result<()>>),
}

impl ForwardedRequest {
    pub(crate) fn reject(self, error: Error) {
        match self {
            ForwardedRequest::Status(reply) => {
                let _ = reply.send(Err(error));
            }
            ForwardedRequest::Cancel(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Delivers requests to the process one at a time, in the order the runner
/// accepted them. Dropping the forwarder lets queued requests drain; they
/// are refused by the process's session check once it is superseded.
pub(crate) struct RequestForwarder {
    process: Arc<JobMasterServiceProcess>,
    tx: mpsc::UnboundedSender<ForwardedRequest>,
}

impl RequestForwarder {
    pub(crate) fn spawn(process: Arc<JobMasterServiceProcess>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = process.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    ForwardedRequest::Status(reply) => {
                        let _ = reply.send(request_status(&target).await);
                    }
                    ForwardedRequest::Cancel(reply) => {
                        let _ = reply.send(cancel(&target).await);
                    }
                }
            }
        });
        Self { process, tx }
    }

    pub(crate) fn process(&self) -> &Arc<JobMasterServiceProcess> {
        &self.process
    }

    pub(crate) fn forward(&self, request: ForwardedRequest) {
        if let Err(mpsc::error::SendError(request)) = self.tx.send(request) {
            request.reject(Error::NotLeader {
                job_id: self.process.job_id(),
            });
        }
    }
}

async fn request_status(process: &JobMasterServiceProcess) -> Result<JobStatus> {
    let service = process.service()?;
    let status = service.request_job_status().await?;
    // late reply from a superseded session
    process.session().check()?;
    Ok(status)
}

async fn cancel(process: &JobMasterServiceProcess) -> Result<()> {
    let service = process.service()?;
    service.cancel().await?;
    process.session().check()
}
