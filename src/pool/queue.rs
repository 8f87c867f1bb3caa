//! Ordered job collection and worker set owned by the scheduler.

use super::error::PoolError;
use super::job::{Job, JobOptions, JobStatus};
use super::worker::{WorkerHandle, WorkerStatus};
use serde::Serialize;
use std::cmp::Reverse;
use std::sync::Arc;
use uuid::Uuid;

struct QueueEntry {
    /// Arrival order, breaks priority ties.
    seq: u64,
    job: Arc<Job>,
}

#[derive(Default)]
pub(crate) struct Queue {
    jobs: Vec<QueueEntry>,
    workers: Vec<Arc<WorkerHandle>>,
    next_seq: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobCounts {
    pub all: usize,
    pub waiting: usize,
    pub ongoing: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerCounts {
    pub all: usize,
    pub available: usize,
    pub busy: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub kind: String,
    pub priority: i64,
    pub status: JobStatus,
    pub progress: u8,
    pub retries: u32,
    pub fails: u32,
    pub added_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl From<&Arc<Job>> for JobView {
    fn from(job: &Arc<Job>) -> Self {
        JobView {
            id: job.id().to_string(),
            kind: job.kind().to_string(),
            priority: job.priority(),
            status: job.status(),
            progress: job.progress(),
            retries: job.retries(),
            fails: job.fails(),
            added_at: job.added_at().to_rfc3339(),
            duration: job.duration().map(|d| d.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub id: Uuid,
    pub subject: String,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job: Option<String>,
}

impl From<&Arc<WorkerHandle>> for WorkerView {
    fn from(worker: &Arc<WorkerHandle>) -> Self {
        WorkerView {
            id: worker.id(),
            subject: worker.handshake().subject.clone(),
            status: worker.status(),
            current_job: worker.current_job().map(|job| job.id().to_string()),
        }
    }
}

/// Point-in-time view of the queue for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub jobs: JobCounts,
    pub workers: WorkerCounts,
    pub waiting: Vec<JobView>,
    pub ongoing: Vec<JobView>,
    pub workers_list: Vec<WorkerView>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn contains_job(&self, job_id: &str) -> bool {
        self.jobs.iter().any(|entry| entry.job.id() == job_id)
    }

    pub fn add_job(&mut self, job: Arc<Job>) -> Result<(), PoolError> {
        if self.contains_job(job.id()) {
            return Err(PoolError::DuplicatedJob(job.id().to_string()));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.push(QueueEntry { seq, job });
        self.sort();
        Ok(())
    }

    pub fn remove_job(&mut self, job_id: &str) -> Result<Arc<Job>, PoolError> {
        let index = self
            .jobs
            .iter()
            .position(|entry| entry.job.id() == job_id)
            .ok_or_else(|| PoolError::JobNotFound(job_id.to_string()))?;
        Ok(self.jobs.remove(index).job)
    }

    pub fn add_worker(&mut self, worker: Arc<WorkerHandle>) -> Result<(), PoolError> {
        if self.workers.iter().any(|w| w.id() == worker.id()) {
            return Err(PoolError::DuplicatedWorker(worker.id()));
        }
        self.workers.push(worker);
        Ok(())
    }

    pub fn remove_worker(&mut self, worker_id: Uuid) -> Result<Arc<WorkerHandle>, PoolError> {
        let index = self
            .workers
            .iter()
            .position(|w| w.id() == worker_id)
            .ok_or(PoolError::WorkerNotFound(worker_id))?;
        Ok(self.workers.remove(index))
    }

    /// Priorities can change while queued, so this runs before every read
    /// that depends on order. The sort is stable and keyed on arrival, so
    /// equal priorities keep first-in-first-out order.
    fn sort(&mut self) {
        self.jobs
            .sort_by_key(|entry| (Reverse(entry.job.priority()), entry.seq));
    }

    fn jobs_with(&mut self, status: JobStatus) -> Vec<Arc<Job>> {
        self.sort();
        self.jobs
            .iter()
            .filter(|entry| entry.job.status() == status)
            .map(|entry| Arc::clone(&entry.job))
            .collect()
    }

    /// Highest priority first, oldest first among equals.
    pub fn waiting_jobs(&mut self) -> Vec<Arc<Job>> {
        self.jobs_with(JobStatus::Waiting)
    }

    pub fn ongoing_jobs(&mut self) -> Vec<Arc<Job>> {
        self.jobs_with(JobStatus::Ongoing)
    }

    /// Jobs that reached a terminal state and have not been removed yet.
    pub fn finished_jobs(&mut self) -> Vec<Arc<Job>> {
        self.sort();
        self.jobs
            .iter()
            .filter(|entry| entry.job.status().is_terminal())
            .map(|entry| Arc::clone(&entry.job))
            .collect()
    }

    pub fn available_workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers
            .iter()
            .filter(|w| w.is_available())
            .cloned()
            .collect()
    }

    pub fn busy_workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers
            .iter()
            .filter(|w| !w.is_available())
            .cloned()
            .collect()
    }

    /// The next worker/job pair to dispatch, if both exist.
    pub fn next_pairing(&mut self) -> Option<(Arc<WorkerHandle>, Arc<Job>)> {
        let worker = self.workers.iter().find(|w| w.is_available())?.clone();
        let job = self.waiting_jobs().into_iter().next()?;
        Some((worker, job))
    }

    /// Every queued job in queue order, as persisted in the snapshot.
    ///
    /// Membership decides what is persisted. A job leaves the queue once it
    /// reaches a final state, so status is not consulted here.
    pub fn snapshot(&mut self) -> Vec<JobOptions> {
        self.sort();
        self.jobs
            .iter()
            .map(|entry| entry.job.options())
            .collect()
    }

    pub fn report(&mut self) -> QueueReport {
        let waiting = self.waiting_jobs();
        let ongoing = self.ongoing_jobs();
        let finished = self.finished_jobs();
        let available = self.available_workers().len();

        QueueReport {
            jobs: JobCounts {
                all: self.jobs.len(),
                waiting: waiting.len(),
                ongoing: ongoing.len(),
                failed: finished.len(),
            },
            workers: WorkerCounts {
                all: self.workers.len(),
                available,
                busy: self.workers.len() - available,
            },
            waiting: waiting.iter().map(JobView::from).collect(),
            ongoing: ongoing.iter().map(JobView::from).collect(),
            workers_list: self.workers.iter().map(WorkerView::from).collect(),
        }
    }
}
