//! Job lifecycle events
//!
//! Leadership transitions, process lifecycle and partition loss are reported
//! as structured [`JobEvent`]s through an [`EventReporter`]. The default
//! reporter writes each event as a JSON line through `tracing`.

use crate::common::ids::{JobId, SessionToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// Job event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    LeadershipGranted,
    LeadershipRevoked,
    ProcessStarted,
    ProcessStopping,
    ProcessTerminated,
    InitializationFailed,
    JobFinished,
    JobMasterFailed,
    PartitionsReleased,
    PartitionMetricsIncomplete,
    WorkerLost,
    RunnerClosed,
}

/// Job event entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub job_id: JobId,
    pub kind: JobEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionToken>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

impl JobEvent {
    pub fn new(job_id: JobId, kind: JobEventKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id,
            kind,
            session: None,
            message: message.into(),
            attributes: None,
        }
    }

    pub fn with_session(mut self, session: SessionToken) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_attributes(mut self, attributes: serde_json::Value) -> Self {
        self.attributes = Some(attributes);
        self
    }
}

/// Sink for job events.
pub trait EventReporter: Send + Sync {
    fn notify_of_added_event(&self, event: &JobEvent);
}

/// Reports events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventReporter;

impl EventReporter for TracingEventReporter {
    fn notify_of_added_event(&self, event: &JobEvent) {
        let line = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
        tracing::info!(target: "jobmaster_core::events", "Reported event: {}", line);
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryEventReporter {
    events: Mutex<Vec<JobEvent>>,
}

impl MemoryEventReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: JobEventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl EventReporter for MemoryEventReporter {
    fn notify_of_added_event(&self, event: &JobEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
