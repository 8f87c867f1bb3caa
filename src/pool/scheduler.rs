use super::error::PoolError;
use super::handle::{QueueEvent, SchedulerCommand, SchedulerHandle};
use super::job::{Job, JobEvent};
use super::queue::Queue;
use super::snapshot::SnapshotStore;
use super::worker::WorkerHandle;
use crate::server::metrics;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Result of one attempt, reported back to the scheduler loop.
struct Settlement {
    attempt_id: u64,
    job_id: String,
    worker_id: Uuid,
    result: Result<Value, PoolError>,
    elapsed: Duration,
}

/// Owns the queue and pairs waiting jobs with available workers.
///
/// All queue mutations happen inside [`PoolScheduler::run`], one command at a
/// time. Attempts run in their own tasks and report back through a channel,
/// so a slow worker never blocks scheduling.
pub struct PoolScheduler {
    queue: Queue,
    snapshot: Arc<dyn SnapshotStore>,
    command_receiver: mpsc::Receiver<SchedulerCommand>,
    settled_tx: mpsc::UnboundedSender<Settlement>,
    settled_rx: mpsc::UnboundedReceiver<Settlement>,
    events: broadcast::Sender<QueueEvent>,
    shutdown_token: CancellationToken,
    /// Minimum time between two scheduling passes.
    dispatch_interval: Duration,
    last_pass: Option<Instant>,
    pass_requested: bool,
    /// Running attempts by attempt id. A job retried on the same worker gets
    /// a fresh id, so a late settlement never clears the newer attempt.
    in_flight: HashMap<u64, (String, JoinHandle<()>)>,
    next_attempt: u64,
}

impl PoolScheduler {
    fn new(
        snapshot: Arc<dyn SnapshotStore>,
        command_receiver: mpsc::Receiver<SchedulerCommand>,
        events: broadcast::Sender<QueueEvent>,
        shutdown_token: CancellationToken,
        dispatch_interval: Duration,
    ) -> Self {
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        Self {
            queue: Queue::new(),
            snapshot,
            command_receiver,
            settled_tx,
            settled_rx,
            events,
            shutdown_token,
            dispatch_interval,
            last_pass: None,
            pass_requested: false,
            in_flight: HashMap::new(),
            next_attempt: 1,
        }
    }

    /// Enqueue jobs restored from a snapshot, before the loop starts.
    pub fn restore(&mut self, jobs: Vec<Arc<Job>>) {
        for job in jobs {
            if let Err(e) = self.queue.add_job(job) {
                warn!("Skipping restored job: {}", e);
            }
        }
        self.persist();
        self.update_metrics();
    }

    pub fn job_count(&self) -> usize {
        self.queue.len()
    }

    /// Main scheduler loop.
    pub async fn run(&mut self) {
        info!(
            "Starting pool scheduler with {} queued jobs (dispatch interval {:?})",
            self.queue.len(),
            self.dispatch_interval
        );
        self.request_pass();

        loop {
            let next_pass = self.next_pass_at();
            tokio::select! {
                _ = sleep_until(next_pass) => {
                    self.run_pass();
                }
                Some(cmd) = self.command_receiver.recv() => {
                    self.handle_command(cmd);
                }
                Some(settlement) = self.settled_rx.recv() => {
                    self.handle_settlement(settlement);
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Pool scheduler received shutdown signal");
                    self.shutdown();
                    break;
                }
            }
        }

        info!("Pool scheduler stopped");
    }

    fn request_pass(&mut self) {
        self.pass_requested = true;
    }

    /// Passes are throttled: at most one per dispatch interval.
    fn next_pass_at(&self) -> Option<Instant> {
        if !self.pass_requested {
            return None;
        }
        let now = Instant::now();
        Some(match self.last_pass {
            Some(last) => (last + self.dispatch_interval).max(now),
            None => now,
        })
    }

    fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::AddJob { job, response } => {
                let result = self.add_job(job);
                let _ = response.send(result);
            }
            SchedulerCommand::RemoveJob { job_id, response } => {
                let result = self.remove_job(&job_id);
                let _ = response.send(result);
            }
            SchedulerCommand::AddWorker { worker, response } => {
                let result = self.add_worker(worker);
                let _ = response.send(result);
            }
            SchedulerCommand::RemoveWorker {
                worker_id,
                response,
            } => {
                let result = self.remove_worker(worker_id);
                let _ = response.send(result);
            }
            SchedulerCommand::Report { response } => {
                let _ = response.send(self.queue.report());
            }
        }
    }

    fn add_job(&mut self, job: Arc<Job>) -> Result<(), PoolError> {
        let job_id = job.id().to_string();
        self.queue.add_job(job)?;
        info!("Queued job {} ({} in queue)", job_id, self.queue.len());
        self.on_queue_changed();
        self.request_pass();
        Ok(())
    }

    /// Drop a job from the queue. An in-flight attempt is not aborted; its
    /// settlement will find the job gone.
    fn remove_job(&mut self, job_id: &str) -> Result<(), PoolError> {
        let job = self.queue.remove_job(job_id)?;
        job.abandon();
        job.seal();
        info!("Removed job {}", job_id);
        self.on_queue_changed();
        Ok(())
    }

    fn add_worker(&mut self, worker: Arc<WorkerHandle>) -> Result<(), PoolError> {
        let worker_id = worker.id();
        let subject = worker.handshake().subject.clone();
        self.queue.add_worker(worker)?;
        info!("Worker {} ({}) joined the pool", worker_id, subject);
        self.notify_size();
        self.update_metrics();
        self.request_pass();
        Ok(())
    }

    /// Callers signal the worker's in-flight job to abort before removing it.
    fn remove_worker(&mut self, worker_id: Uuid) -> Result<(), PoolError> {
        self.queue.remove_worker(worker_id)?;
        info!("Worker {} left the pool", worker_id);
        self.notify_size();
        self.update_metrics();
        Ok(())
    }

    /// Pair every available worker with the best waiting job.
    fn run_pass(&mut self) {
        self.pass_requested = false;
        self.last_pass = Some(Instant::now());

        while let Some((worker, job)) = self.queue.next_pairing() {
            let Err(e) = self.dispatch(&worker, &job) else {
                continue;
            };
            if !e.is_defect() {
                error!("Dispatch of job {} failed, aborting pass: {}", job.id(), e);
                break;
            }
            metrics::record_scheduling_defect(e.code());
            match e {
                PoolError::WorkerExecuteInvalid(_) | PoolError::WorkerBusy(_) => {
                    error!("Scheduling defect, dropping worker {}: {}", worker.id(), e);
                    if self.queue.remove_worker(worker.id()).is_ok() {
                        self.notify_size();
                    }
                }
                _ => {
                    error!("Scheduling defect, dropping job {}: {}", job.id(), e);
                    if self.queue.remove_job(job.id()).is_ok() {
                        job.abandon();
                        job.seal();
                        self.on_queue_changed();
                    }
                }
            }
        }

        self.update_metrics();
    }

    fn dispatch(&mut self, worker: &Arc<WorkerHandle>, job: &Arc<Job>) -> Result<(), PoolError> {
        let mut job_events = job.subscribe()?;
        let attempt = worker.execute(job)?;

        let job_id = job.id().to_string();
        let worker_id = worker.id();
        let attempt_id = self.next_attempt;
        self.next_attempt += 1;
        info!(
            "Dispatching job {} (priority {}) to worker {} (attempt {})",
            job_id,
            job.priority(),
            worker_id,
            attempt_id
        );
        self.persist();

        let events = self.events.clone();
        let settled_tx = self.settled_tx.clone();
        let task_job_id = job_id.clone();
        let handle = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let mut attempt = attempt;
            let mut listening = true;
            let result = loop {
                tokio::select! {
                    result = &mut attempt => break result,
                    event = job_events.recv(), if listening => match event {
                        Ok(event) => forward_status(&events, event),
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("Missed {} events for job {}", skipped, task_job_id);
                        }
                        Err(RecvError::Closed) => listening = false,
                    },
                }
            };
            while let Ok(event) = job_events.try_recv() {
                forward_status(&events, event);
            }
            drop(job_events);

            let _ = settled_tx.send(Settlement {
                attempt_id,
                job_id: task_job_id,
                worker_id,
                result,
                elapsed: started.elapsed(),
            });
        });
        self.in_flight.insert(attempt_id, (job_id, handle));
        Ok(())
    }

    fn handle_settlement(&mut self, settlement: Settlement) {
        let Settlement {
            attempt_id,
            job_id,
            worker_id,
            result,
            elapsed,
        } = settlement;
        self.in_flight.remove(&attempt_id);

        match result {
            Ok(_) => {
                info!(
                    "Job {} done on worker {} in {:?}",
                    job_id, worker_id, elapsed
                );
                metrics::record_job_attempt("done", elapsed);
                self.finish_job(&job_id);
            }
            Err(PoolError::JobWillRetry { retries_left, .. }) => {
                info!(
                    "Job {} failed on worker {}, back to waiting ({} retries left)",
                    job_id, worker_id, retries_left
                );
                metrics::record_job_attempt("retry", elapsed);
                self.on_queue_changed();
            }
            Err(e) if e.is_defect() => {
                error!("Scheduling defect, dropping job {}: {}", job_id, e);
                metrics::record_scheduling_defect(e.code());
                self.finish_job(&job_id);
            }
            Err(e) => {
                warn!("Job {} failed for good on worker {}: {}", job_id, worker_id, e);
                metrics::record_job_attempt("failed", elapsed);
                self.finish_job(&job_id);
            }
        }

        self.request_pass();
    }

    /// Remove a job that reached a terminal state.
    fn finish_job(&mut self, job_id: &str) {
        match self.queue.remove_job(job_id) {
            Ok(job) => {
                // No-op for jobs the attempt already settled
                job.abandon();
                job.seal();
                self.on_queue_changed();
            }
            Err(_) => debug!("Job {} was already removed from the queue", job_id),
        }
    }

    fn on_queue_changed(&mut self) {
        self.persist();
        self.notify_size();
        self.update_metrics();
    }

    fn persist(&mut self) {
        let jobs = self.queue.snapshot();
        if let Err(e) = self.snapshot.save(&jobs) {
            error!("Failed to persist queue snapshot: {:#}", e);
        }
    }

    fn notify_size(&self) {
        let _ = self.events.send(QueueEvent::SizeChanged {
            jobs: self.queue.len(),
            workers: self.queue.worker_count(),
        });
    }

    fn update_metrics(&mut self) {
        metrics::set_queue_sizes(
            self.queue.waiting_jobs().len(),
            self.queue.ongoing_jobs().len(),
            self.queue.available_workers().len(),
            self.queue.busy_workers().len(),
        );
    }

    fn shutdown(&mut self) {
        for (attempt_id, (job_id, handle)) in self.in_flight.drain() {
            debug!("Aborting attempt {} for job {}", attempt_id, job_id);
            handle.abort();
        }
        // Interrupted jobs are saved as ONGOING and retried on next start
        self.persist();
        info!("Pool scheduler shutdown complete");
    }
}

fn forward_status(events: &broadcast::Sender<QueueEvent>, event: JobEvent) {
    if let JobEvent::StatusChanged { job_id, from, to } = event {
        let _ = events.send(QueueEvent::JobStatusChanged { job_id, from, to });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cancel `shutdown_token` and wait for the scheduler task to finish its
/// shutdown, at most `grace`. Returns false if the task had to be abandoned.
pub async fn stop_scheduler(
    task: JoinHandle<()>,
    shutdown_token: &CancellationToken,
    grace: Duration,
) -> bool {
    shutdown_token.cancel();
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("Scheduler task ended abnormally: {}", e);
            false
        }
        Err(_) => {
            warn!("Scheduler did not stop within {:?}", grace);
            false
        }
    }
}

/// Create a scheduler and its handle.
pub fn create_scheduler(
    snapshot: Arc<dyn SnapshotStore>,
    dispatch_interval: Duration,
    shutdown_token: CancellationToken,
) -> (PoolScheduler, SchedulerHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    let scheduler = PoolScheduler::new(
        snapshot,
        command_rx,
        events.clone(),
        shutdown_token,
        dispatch_interval,
    );
    let handle = SchedulerHandle::new(command_tx, events);

    (scheduler, handle)
}
