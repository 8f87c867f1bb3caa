use super::job::JobStatus;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by jobs, workers and the scheduler.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PoolError {
    #[error("Invalid job argument '{field}': {reason}")]
    ArgumentsInvalid { field: &'static str, reason: String },

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job has no async action")]
    AsyncActionMissing,

    #[error("Job {id} failed and will be retried ({retries_left} retries left)")]
    JobWillRetry { id: String, retries_left: u32 },

    #[error("Job {id} failed: {reason}")]
    JobFailed { id: String, reason: String },

    #[error("Job {0} is already queued")]
    DuplicatedJob(String),

    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("Worker {0} is already registered")]
    DuplicatedWorker(Uuid),

    #[error("Worker {0} not found")]
    WorkerNotFound(Uuid),

    #[error("Worker {0} is already executing a job")]
    WorkerBusy(Uuid),

    #[error("Job {0} has no event surface")]
    JobHasNoEvents(String),

    #[error("Worker {0} cannot execute jobs")]
    WorkerExecuteInvalid(Uuid),

    #[error("Request requires an acknowledgement id")]
    AckMissing,

    #[error("Scheduler is not running")]
    SchedulerUnavailable,
}

impl PoolError {
    /// Misconfigured jobs or workers. These abort the attempt and are never
    /// retried as ordinary job failures.
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            PoolError::JobHasNoEvents(_)
                | PoolError::WorkerExecuteInvalid(_)
                | PoolError::WorkerBusy(_)
                | PoolError::AsyncActionMissing
                | PoolError::ArgumentsInvalid { .. }
                | PoolError::InvalidTransition { .. }
        )
    }

    /// Whether the job this error refers to is done for good.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PoolError::JobWillRetry { .. })
    }

    /// HTTP-like status code reported to callers.
    pub fn status_code(&self) -> u16 {
        match self {
            PoolError::DuplicatedJob(_) | PoolError::DuplicatedWorker(_) => 409,
            PoolError::JobNotFound(_) | PoolError::WorkerNotFound(_) => 404,
            PoolError::SchedulerUnavailable => 503,
            _ => 500,
        }
    }

    /// Stable machine-readable identifier, used in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::ArgumentsInvalid { .. } => "arguments_invalid",
            PoolError::InvalidTransition { .. } => "invalid_transition",
            PoolError::AsyncActionMissing => "async_action_missing",
            PoolError::JobWillRetry { .. } => "job_will_retry",
            PoolError::JobFailed { .. } => "job_failed",
            PoolError::DuplicatedJob(_) => "duplicated_job",
            PoolError::JobNotFound(_) => "job_not_found",
            PoolError::DuplicatedWorker(_) => "duplicated_worker",
            PoolError::WorkerNotFound(_) => "worker_not_found",
            PoolError::WorkerBusy(_) => "worker_busy",
            PoolError::JobHasNoEvents(_) => "job_has_no_events",
            PoolError::WorkerExecuteInvalid(_) => "worker_execute_invalid",
            PoolError::AckMissing => "ack_missing",
            PoolError::SchedulerUnavailable => "scheduler_unavailable",
        }
    }
}
