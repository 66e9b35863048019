//! # jobmaster-core
//!
//! Control-plane core of a distributed dataflow engine:
//! - a fenced leadership runner per job, owning at most one live job master
//! - the job master process lifecycle and the factory that builds it
//! - the shuffle context bridge through which the shuffle layer reports lost
//!   partitions and reads partition metrics
//!
//! ## Architecture
//!
//! ```text
//!  election service          clients
//!        │ grant/revoke         │ status/result/cancel
//!        ▼                      ▼
//! ┌──────────────────────────────────────┐
//! │ LeadershipRunner (one mailbox/job)   │
//! │   SessionFence: generation counter   │
//! └───────────┬──────────────────────────┘
//!             │ factory.create(session)
//!   ┌─────────▼──────────┐      ┌───────────────┐
//!   │ JobMasterService-  │─────▶│ ShuffleMaster │
//!   │ Process (session)  │ reg. │               │
//!   │  + ShuffleContext- │◀─────│ worker lost / │
//!   │    Bridge          │      │ metrics query │
//!   └─────────┬──────────┘      └───────────────┘
//!             │ partitions, lost queue
//!   ┌─────────▼──────────┐
//!   │ PartitionTracker   │
//!   └────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # randomized leadership churn against simulated workers
//! jobmaster-sim run --jobs 3 --rounds 50 --seed 7 --metrics-timeout 200ms
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod jobmaster;
pub mod shuffle;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use jobmaster::{JobRunnerRegistry, LeadershipRunner, RunnerState};
pub use shuffle::{ShuffleContextBridge, ShuffleMaster};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
