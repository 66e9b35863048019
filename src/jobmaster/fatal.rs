//! Escalation path for errors this core cannot recover from

use crate::common::Error;

/// Receives irrecoverable errors (initialization failures, job master crashes).
///
/// The expected reaction is a process-wide abort or restart; the runner does
/// not retry on its own.
pub trait FatalErrorHandler: Send + Sync {
    fn on_fatal_error(&self, error: &Error);
}

/// Logs fatal errors and leaves the reaction to the embedding process
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFatalErrorHandler;

impl FatalErrorHandler for LoggingFatalErrorHandler {
    fn on_fatal_error(&self, error: &Error) {
        tracing::error!(error = %error, "Fatal error in job master runner");
    }
}
