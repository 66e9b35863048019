//! Shuffle partition lifecycle
//!
//! Partition tracking per job, the per-process bridge the shuffle master
//! calls into, and the shuffle master itself.

pub mod context;
pub mod master;
pub mod partition;
pub mod tracker;
pub mod worker;

pub use context::{JobShuffleContext, ShuffleContextBridge};
pub use master::{ShuffleMaster, ShuffleRegistration, WorkerLossReport};
pub use partition::{PartitionMetricsReport, PartitionWithMetrics};
pub use tracker::{JobPartitionTracker, LostPartitionQueue, PartitionTracker, TrackedPartition};
pub use worker::{StaticWorkerDirectory, TaskExecutorGateway, WorkerDirectory};
