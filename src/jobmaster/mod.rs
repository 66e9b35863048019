//! Fenced job master lifecycle
//!
//! Leadership runner, the process it owns per session, and the factory that
//! builds those processes.

pub mod factory;
pub mod fatal;
pub mod fencing;
mod forwarder;
pub mod job;
pub mod leadership;
pub mod process;
pub mod registry;

pub use factory::{
    DefaultJobMasterServiceProcessFactory, JobMasterContext, JobMasterServiceFactory,
    JobMasterServiceProcessFactory,
};
pub use fatal::{FatalErrorHandler, LoggingFatalErrorHandler};
pub use fencing::{FencingToken, SessionFence, SessionGuard};
pub use job::{JobDefinition, JobResult, JobStatus, RunnerResult};
pub use leadership::{LeaderContender, LeadershipRunner, RunnerServices, RunnerState};
pub use process::{CompletionHandle, JobMasterService, JobMasterServiceProcess, ProcessOutcome};
pub use registry::JobRunnerRegistry;
