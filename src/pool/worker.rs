//! Orchestration-side handle for one connected worker.

use super::error::PoolError;
use super::job::Job;
use super::link::{channels, WorkerLink};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Available,
    Busy,
}

/// Identity of the connection a worker came in on.
#[derive(Debug, Clone, Serialize)]
pub struct Handshake {
    /// Token subject.
    pub subject: String,
    pub connected_at: DateTime<Utc>,
}

impl Handshake {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            connected_at: Utc::now(),
        }
    }
}

struct WorkerSlot {
    status: WorkerStatus,
    current_job: Option<Weak<Job>>,
}

pub struct WorkerHandle {
    id: Uuid,
    handshake: Handshake,
    link: Arc<dyn WorkerLink>,
    slot: Mutex<WorkerSlot>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("subject", &self.handshake.subject)
            .field("status", &self.status())
            .finish()
    }
}

/// Puts the worker back to AVAILABLE however the attempt ends, including
/// when the attempt future is dropped before completing.
struct SlotGuard {
    worker: Arc<WorkerHandle>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slot = self.worker.slot();
        slot.status = WorkerStatus::Available;
        slot.current_job = None;
    }
}

impl WorkerHandle {
    pub fn new(id: Uuid, handshake: Handshake, link: Arc<dyn WorkerLink>) -> Arc<Self> {
        Arc::new(Self {
            id,
            handshake,
            link,
            slot: Mutex::new(WorkerSlot {
                status: WorkerStatus::Available,
                current_job: None,
            }),
        })
    }

    fn slot(&self) -> MutexGuard<'_, WorkerSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn status(&self) -> WorkerStatus {
        self.slot().status
    }

    pub fn is_available(&self) -> bool {
        self.status() == WorkerStatus::Available
    }

    /// The job bound to this worker, if any and still alive.
    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.slot().current_job.as_ref().and_then(Weak::upgrade)
    }

    /// Bind `job` to this worker and start it.
    ///
    /// Preconditions are checked synchronously. On success the worker is
    /// BUSY and the job ONGOING by the time this returns.
    pub fn execute(
        self: &Arc<Self>,
        job: &Arc<Job>,
    ) -> Result<BoxFuture<'static, Result<Value, PoolError>>, PoolError> {
        if !self.link.is_open() {
            return Err(PoolError::WorkerExecuteInvalid(self.id));
        }
        {
            let mut slot = self.slot();
            if slot.status == WorkerStatus::Busy {
                return Err(PoolError::WorkerBusy(self.id));
            }
            slot.status = WorkerStatus::Busy;
            slot.current_job = Some(Arc::downgrade(job));
        }
        let guard = SlotGuard {
            worker: Arc::clone(self),
        };

        debug!("Worker {} executing job {}", self.id, job.id());
        let attempt = job.start(Arc::clone(&self.link));
        Ok(async move {
            let _guard = guard;
            attempt.await
        }
        .boxed())
    }

    /// Ask the worker to abort its current job. Returns whether a signal was
    /// sent; nothing confirms the worker actually stopped.
    pub async fn send_kill_event(&self) -> bool {
        let Some(job) = self.current_job() else {
            return false;
        };
        let channel = channels::kill(job.id());
        match self.link.emit(&channel, Value::Null).await {
            Ok(()) => {
                info!("Sent kill signal for job {} to worker {}", job.id(), self.id);
                true
            }
            Err(e) => {
                warn!(
                    "Could not send kill signal for job {} to worker {}: {}",
                    job.id(),
                    self.id,
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::job::{JobOptions, JobStatus};
    use crate::pool::testing::{FakeLink, ScriptedAction};
    use serde_json::json;

    fn worker(link: Arc<FakeLink>) -> Arc<WorkerHandle> {
        WorkerHandle::new(Uuid::new_v4(), Handshake::new("worker-1"), link)
    }

    #[tokio::test]
    async fn execute_binds_and_releases() {
        let link = FakeLink::open();
        let worker = worker(link.clone());
        let action = ScriptedAction::new();
        let job = Job::new(action.clone(), JobOptions::default()).unwrap();

        let attempt = worker.execute(&job).unwrap();
        assert_eq!(worker.status(), WorkerStatus::Busy);
        assert_eq!(worker.current_job().unwrap().id(), job.id());
        assert_eq!(job.status(), JobStatus::Ongoing);

        action.resolve_next(json!({"statusCode": 200}));
        attempt.await.unwrap();

        assert_eq!(worker.status(), WorkerStatus::Available);
        assert!(worker.current_job().is_none());
    }

    #[tokio::test]
    async fn busy_worker_rejects_second_job() {
        let worker = worker(FakeLink::open());
        let first = ScriptedAction::new();
        let job_a = Job::new(first.clone(), JobOptions::default()).unwrap();
        let job_b = Job::new(ScriptedAction::new(), JobOptions::default()).unwrap();

        let attempt = worker.execute(&job_a).unwrap();
        let err = worker.execute(&job_b).err().unwrap();
        assert_eq!(err, PoolError::WorkerBusy(worker.id()));
        assert_eq!(job_b.status(), JobStatus::Waiting);

        first.resolve_next(json!({}));
        attempt.await.unwrap();
        assert!(worker.is_available());
    }

    #[tokio::test]
    async fn failed_attempt_still_releases() {
        let worker = worker(FakeLink::open());
        let action = ScriptedAction::new();
        let job = Job::new(action.clone(), JobOptions::default()).unwrap();

        action.reject_next("encoder crashed");
        let err = worker.execute(&job).unwrap().await.unwrap_err();
        assert!(err.is_terminal());
        assert!(worker.is_available());
        assert!(worker.current_job().is_none());
    }

    #[tokio::test]
    async fn dropped_attempt_releases() {
        let worker = worker(FakeLink::open());
        let job = Job::new(ScriptedAction::new(), JobOptions::default()).unwrap();

        let attempt = worker.execute(&job).unwrap();
        drop(attempt);
        assert!(worker.is_available());
    }

    #[test]
    fn closed_link_cannot_execute() {
        let link = FakeLink::open();
        link.close();
        let worker = worker(link);
        let job = Job::new(ScriptedAction::new(), JobOptions::default()).unwrap();

        let err = worker.execute(&job).err().unwrap();
        assert_eq!(err, PoolError::WorkerExecuteInvalid(worker.id()));
        assert_eq!(job.status(), JobStatus::Waiting);
        assert!(worker.is_available());
    }

    #[tokio::test]
    async fn kill_event_targets_current_job() {
        let link = FakeLink::open();
        let worker = worker(link.clone());
        assert!(!worker.send_kill_event().await);
        assert!(link.emitted().is_empty());

        let action = ScriptedAction::new();
        let job = Job::new(action.clone(), JobOptions::default()).unwrap();
        let attempt = worker.execute(&job).unwrap();

        assert!(worker.send_kill_event().await);
        assert_eq!(
            link.emitted(),
            vec![(format!("job.{}.kill", job.id()), Value::Null)]
        );

        action.reject_next("killed");
        let _ = attempt.await;
    }
}
