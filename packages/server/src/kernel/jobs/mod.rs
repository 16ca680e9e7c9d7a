//! Durable background job system.
//!
//! Producers dispatch typed payloads onto named queues; per-queue worker
//! pools claim, execute, and retry them. The jobs table is the only
//! cross-worker serialisation point.

pub mod job;
pub mod payload;
pub mod queue;
pub mod registry;
pub mod worker;

pub use job::{queues, Job, JobStatus};
pub use payload::JobPayload;
pub use queue::{DispatchOptions, JobQueue, QueueStats, StallSweep};
pub use registry::{JobRegistry, SharedJobRegistry};
pub use worker::{QueueWorkerConfig, WorkerPool};
