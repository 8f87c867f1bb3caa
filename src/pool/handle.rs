use super::error::PoolError;
use super::job::{Job, JobStatus};
use super::queue::QueueReport;
use super::worker::WorkerHandle;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

/// Command sent to the scheduler.
pub enum SchedulerCommand {
    AddJob {
        job: Arc<Job>,
        response: oneshot::Sender<Result<(), PoolError>>,
    },
    RemoveJob {
        job_id: String,
        response: oneshot::Sender<Result<(), PoolError>>,
    },
    AddWorker {
        worker: Arc<WorkerHandle>,
        response: oneshot::Sender<Result<(), PoolError>>,
    },
    RemoveWorker {
        worker_id: Uuid,
        response: oneshot::Sender<Result<(), PoolError>>,
    },
    Report {
        response: oneshot::Sender<QueueReport>,
    },
}

/// Queue-level notifications, republished from jobs and queue mutations.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    SizeChanged {
        jobs: usize,
        workers: usize,
    },
    JobStatusChanged {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Handle to interact with the scheduler from connection handlers.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    events: broadcast::Sender<QueueEvent>,
}

impl SchedulerHandle {
    pub(super) fn new(
        command_tx: mpsc::Sender<SchedulerCommand>,
        events: broadcast::Sender<QueueEvent>,
    ) -> Self {
        Self { command_tx, events }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Result<T, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| PoolError::SchedulerUnavailable)?;
        rx.await.map_err(|_| PoolError::SchedulerUnavailable)
    }

    pub async fn add_job(&self, job: Arc<Job>) -> Result<(), PoolError> {
        self.call(|response| SchedulerCommand::AddJob { job, response })
            .await?
    }

    pub async fn remove_job(&self, job_id: &str) -> Result<(), PoolError> {
        let job_id = job_id.to_string();
        self.call(|response| SchedulerCommand::RemoveJob { job_id, response })
            .await?
    }

    pub async fn add_worker(&self, worker: Arc<WorkerHandle>) -> Result<(), PoolError> {
        self.call(|response| SchedulerCommand::AddWorker { worker, response })
            .await?
    }

    pub async fn remove_worker(&self, worker_id: Uuid) -> Result<(), PoolError> {
        self.call(|response| SchedulerCommand::RemoveWorker {
            worker_id,
            response,
        })
        .await?
    }

    pub async fn report(&self) -> Result<QueueReport, PoolError> {
        self.call(|response| SchedulerCommand::Report { response })
            .await
    }

    /// Subscribe to queue-level events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}
