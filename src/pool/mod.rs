//! Job pool: jobs, connected workers and the scheduler pairing them.
//!
//! The scheduler runs as a single task owning the queue. Everything else
//! talks to it through a [`SchedulerHandle`].

mod action;
pub mod error;
mod handle;
pub mod job;
mod link;
pub mod queue;
mod scheduler;
mod snapshot;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use action::{ActionFuture, ActionRegistry, JobAction, JobFailure};
pub use error::PoolError;
pub use handle::{QueueEvent, SchedulerHandle};
pub use job::{priority, Job, JobDuration, JobEvent, JobOptions, JobStatus};
pub use link::{channels, LinkError, WorkerLink};
pub use queue::QueueReport;
pub use scheduler::{create_scheduler, stop_scheduler, PoolScheduler};
pub use snapshot::{restore_jobs, JsonFileSnapshotStore, NoopSnapshotStore, SnapshotStore};
pub use worker::{Handshake, WorkerHandle, WorkerStatus};
