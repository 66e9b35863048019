//! Common utilities and types shared across jobmaster-core

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod metrics;
pub mod utils;

pub use self::config::{Config, ShuffleConfig};
pub use self::error::{Error, Result};
pub use events::{EventReporter, JobEvent, JobEventKind, MemoryEventReporter, TracingEventReporter};
pub use ids::{JobId, ResourceId, ResultPartitionId, SessionToken};
pub use metrics::{Counter, Gauge, RunnerMetrics, ShuffleMetrics};
pub use utils::parse_duration;
