//! Job state machine.
//!
//! A job owns its live fields behind a mutex and publishes every actual
//! change on a broadcast bus. Transitions:
//!
//! ```text
//! WAITING --start()--> ONGOING --ok--> DONE
//!                         |
//!                         +--err--> FAILED --retries > 0--> WAITING
//! ```
//!
//! Any other move is refused with [`PoolError::InvalidTransition`].

use super::action::{ActionRegistry, JobAction, JobFailure};
use super::error::PoolError;
use super::link::WorkerLink;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Named priority tiers. Any integer is a valid priority.
pub mod priority {
    pub const LOW: i64 = 0;
    pub const MEDIUM: i64 = 100;
    pub const HIGH: i64 = 200;
    pub const CRITICAL: i64 = 1000;
}

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Waiting,
    Ongoing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Ongoing => "ONGOING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Whether a job may move from this status to `to`.
    pub fn can_move_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Waiting, JobStatus::Ongoing)
                | (JobStatus::Ongoing, JobStatus::Done)
                | (JobStatus::Ongoing, JobStatus::Failed)
                | (JobStatus::Failed, JobStatus::Waiting)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WAITING" => Ok(JobStatus::Waiting),
            "ONGOING" => Ok(JobStatus::Ongoing),
            "DONE" => Ok(JobStatus::Done),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(format!("unknown status '{}'", s)),
        }
    }
}

/// Change notifications published by a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    StatusChanged {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
    PriorityChanged {
        job_id: String,
        from: i64,
        to: i64,
    },
    ProgressChanged {
        job_id: String,
        from: u8,
        to: u8,
    },
}

/// Raw job options, as received from callers or read back from a snapshot.
///
/// Everything is optional and unvalidated; [`Job::create`] checks ranges.
/// Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fails: Option<i64>,
    /// Action kind, resolved through the [`ActionRegistry`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> PoolError {
    PoolError::ArgumentsInvalid {
        field,
        reason: reason.into(),
    }
}

fn timestamp(field: &'static str, millis: Option<i64>) -> Result<Option<DateTime<Utc>>, PoolError> {
    match millis {
        None => Ok(None),
        Some(ms) if ms < 0 => Err(invalid(field, format!("must be non-negative, got {}", ms))),
        Some(ms) => DateTime::<Utc>::from_timestamp_millis(ms)
            .map(Some)
            .ok_or_else(|| invalid(field, format!("out of range: {}", ms))),
    }
}

fn counter(field: &'static str, value: Option<i64>) -> Result<u32, PoolError> {
    match value {
        None => Ok(0),
        Some(v) => u32::try_from(v)
            .map_err(|_| invalid(field, format!("must be a non-negative integer, got {}", v))),
    }
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}

/// How long a job has been running, or ran for its last attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobDuration {
    pub elapsed: Duration,
    pub running: bool,
    pub failed: bool,
}

impl fmt::Display for JobDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failed {
            f.write_str("failed:")?;
        }
        write!(f, "{:.3}s", self.elapsed.as_secs_f64())
    }
}

struct JobState {
    priority: i64,
    status: JobStatus,
    progress: u8,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    retries: u32,
    fails: u32,
}

type Outcome = Option<Result<Value, PoolError>>;

pub struct Job {
    id: String,
    added_at: DateTime<Utc>,
    action: Arc<dyn JobAction>,
    state: Mutex<JobState>,
    /// `None` once the job has been sealed.
    events: Mutex<Option<broadcast::Sender<JobEvent>>>,
    outcome: watch::Sender<Outcome>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.action.kind())
            .field("status", &state.status)
            .field("priority", &state.priority)
            .field("retries", &state.retries)
            .field("fails", &state.fails)
            .finish()
    }
}

impl Job {
    /// Validate `opts` and build a job.
    ///
    /// The action is either given explicitly or rebuilt from `opts.kind` and
    /// `opts.params`. When both are present the explicit action wins. A job
    /// can never be created ONGOING: that status is coerced to WAITING.
    pub fn create(
        action: Option<Arc<dyn JobAction>>,
        opts: JobOptions,
        registry: &ActionRegistry,
    ) -> Result<Arc<Self>, PoolError> {
        let priority = opts.priority.unwrap_or(priority::MEDIUM);

        let progress = match opts.progress {
            None => 0,
            Some(p) if (0..=100).contains(&p) => p as u8,
            Some(p) => {
                return Err(invalid(
                    "progress",
                    format!("must be between 0 and 100, got {}", p),
                ))
            }
        };

        let status = match opts.status.as_deref() {
            None => JobStatus::Waiting,
            Some(s) => s.parse::<JobStatus>().map_err(|e| invalid("status", e))?,
        };
        let status = match status {
            JobStatus::Ongoing => JobStatus::Waiting,
            other => other,
        };

        let added_at = timestamp("addedAt", opts.added_at)?.unwrap_or_else(Utc::now);
        let started_at = timestamp("startedAt", opts.started_at)?;
        let finished_at = timestamp("finishedAt", opts.finished_at)?;
        let retries = counter("retries", opts.retries)?;
        let fails = counter("fails", opts.fails)?;

        let action = match (action, opts.kind.as_deref()) {
            (Some(action), _) => action,
            (None, Some(kind)) => registry.build(kind, opts.params.clone().unwrap_or(Value::Null))?,
            (None, None) => return Err(PoolError::AsyncActionMissing),
        };

        let id = opts
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (outcome, _) = watch::channel(None);

        Ok(Arc::new(Self {
            id,
            added_at,
            action,
            state: Mutex::new(JobState {
                priority,
                status,
                progress,
                started_at,
                finished_at,
                retries,
                fails,
            }),
            events: Mutex::new(Some(events)),
            outcome,
        }))
    }

    /// Build a job around an explicit action.
    pub fn new(action: Arc<dyn JobAction>, opts: JobOptions) -> Result<Arc<Self>, PoolError> {
        Self::create(Some(action), opts, &ActionRegistry::default())
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: JobEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            // No receivers is fine
            let _ = tx.send(event);
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn kind(&self) -> &str {
        self.action.kind()
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    pub fn priority(&self) -> i64 {
        self.state().priority
    }

    pub fn progress(&self) -> u8 {
        self.state().progress
    }

    pub fn retries(&self) -> u32 {
        self.state().retries
    }

    pub fn fails(&self) -> u32 {
        self.state().fails
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state().finished_at
    }

    /// Full options describing this job, suitable for persisting.
    pub fn options(&self) -> JobOptions {
        let state = self.state();
        JobOptions {
            id: Some(self.id.clone()),
            priority: Some(state.priority),
            progress: Some(state.progress as i64),
            status: Some(state.status.as_str().to_string()),
            added_at: Some(self.added_at.timestamp_millis()),
            started_at: state.started_at.map(|t| t.timestamp_millis()),
            finished_at: state.finished_at.map(|t| t.timestamp_millis()),
            retries: Some(state.retries as i64),
            fails: Some(state.fails as i64),
            kind: Some(self.action.kind().to_string()),
            params: Some(self.action.params()),
        }
    }

    fn transition(&self, state: &mut JobState, status: JobStatus) -> Result<bool, PoolError> {
        if state.status == status {
            return Ok(false);
        }
        let from = state.status;
        if !from.can_move_to(status) {
            return Err(PoolError::InvalidTransition {
                id: self.id.clone(),
                from,
                to: status,
            });
        }
        state.status = status;
        self.emit(JobEvent::StatusChanged {
            job_id: self.id.clone(),
            from,
            to: status,
        });
        Ok(true)
    }

    /// Returns whether the status actually changed. Setting the current
    /// status again is a no-op; moves outside the state machine are refused.
    pub fn set_status(&self, status: JobStatus) -> Result<bool, PoolError> {
        let mut state = self.state();
        self.transition(&mut state, status)
    }

    pub fn set_priority(&self, priority: i64) -> bool {
        let mut state = self.state();
        if state.priority == priority {
            return false;
        }
        let from = state.priority;
        state.priority = priority;
        self.emit(JobEvent::PriorityChanged {
            job_id: self.id.clone(),
            from,
            to: priority,
        });
        true
    }

    pub fn set_progress(&self, progress: i64) -> Result<bool, PoolError> {
        if !(0..=100).contains(&progress) {
            return Err(invalid(
                "progress",
                format!("must be between 0 and 100, got {}", progress),
            ));
        }
        let progress = progress as u8;
        let mut state = self.state();
        if state.progress == progress {
            return Ok(false);
        }
        let from = state.progress;
        state.progress = progress;
        self.emit(JobEvent::ProgressChanged {
            job_id: self.id.clone(),
            from,
            to: progress,
        });
        Ok(true)
    }

    /// `None` until the job has started.
    pub fn duration(&self) -> Option<JobDuration> {
        let state = self.state();
        let started_at = state.started_at?;
        let duration = match (state.status, state.finished_at) {
            (JobStatus::Ongoing, _) | (_, None) => JobDuration {
                elapsed: elapsed(started_at, Utc::now()),
                running: true,
                failed: false,
            },
            (status, Some(finished_at)) => JobDuration {
                elapsed: elapsed(started_at, finished_at),
                running: false,
                failed: status == JobStatus::Failed,
            },
        };
        Some(duration)
    }

    /// Subscribe to this job's change notifications.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<JobEvent>, PoolError> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| PoolError::JobHasNoEvents(self.id.clone()))
    }

    /// Close the event surface. Existing subscribers see the bus close.
    pub fn seal(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Start one attempt against the worker behind `link`.
    ///
    /// The transition to ONGOING happens before this returns. The returned
    /// future resolves with the action's value, or with the retry policy's
    /// error if the action rejected. A job that is not WAITING never runs
    /// its action: the future resolves with [`PoolError::InvalidTransition`].
    pub fn start(
        self: &Arc<Self>,
        link: Arc<dyn WorkerLink>,
    ) -> BoxFuture<'static, Result<Value, PoolError>> {
        {
            let mut state = self.state();
            let refused = match self.transition(&mut state, JobStatus::Ongoing) {
                Ok(true) => None,
                // Already running
                Ok(false) => Some(PoolError::InvalidTransition {
                    id: self.id.clone(),
                    from: JobStatus::Ongoing,
                    to: JobStatus::Ongoing,
                }),
                Err(e) => Some(e),
            };
            if let Some(e) = refused {
                return async move { Err(e) }.boxed();
            }
            state.started_at = Some(Utc::now());
            state.finished_at = None;
        }
        debug!("Job {} started ({})", self.id, self.kind());

        let attempt = self.action.run(Arc::clone(self), link);
        let job = Arc::clone(self);
        async move {
            match attempt.await {
                Ok(value) => {
                    job.finish_done()?;
                    job.settle(Ok(value.clone()));
                    Ok(value)
                }
                Err(failure) => {
                    warn!("Job {} attempt failed: {}", job.id, failure);
                    Err(job.on_fail(&failure))
                }
            }
        }
        .boxed()
    }

    fn finish_done(&self) -> Result<(), PoolError> {
        let mut state = self.state();
        self.transition(&mut state, JobStatus::Done)?;
        state.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Retry policy, run after a rejected attempt.
    ///
    /// ONGOING -> FAILED, and back to WAITING while budget remains, happen
    /// under one lock so no reader ever sees a retryable job as FAILED.
    /// Returns [`PoolError::JobWillRetry`] while budget remains, otherwise
    /// settles the job and returns the terminal [`PoolError::JobFailed`].
    pub fn on_fail(&self, failure: &JobFailure) -> PoolError {
        let mut state = self.state();
        if let Err(e) = self.transition(&mut state, JobStatus::Failed) {
            return e;
        }
        state.finished_at = Some(Utc::now());
        state.fails += 1;
        if state.retries > 0 {
            if let Err(e) = self.transition(&mut state, JobStatus::Waiting) {
                return e;
            }
            state.retries -= 1;
            return PoolError::JobWillRetry {
                id: self.id.clone(),
                retries_left: state.retries,
            };
        }
        drop(state);

        let err = PoolError::JobFailed {
            id: self.id.clone(),
            reason: failure.to_string(),
        };
        self.settle(Err(err.clone()));
        err
    }

    fn settle(&self, outcome: Result<Value, PoolError>) {
        self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
    }

    /// Settle a job dropped from the queue before reaching a final state.
    pub fn abandon(&self) {
        self.settle(Err(PoolError::JobFailed {
            id: self.id.clone(),
            reason: "removed from queue".to_string(),
        }));
    }

    /// Wait for the final outcome: the action's value once DONE, or the
    /// terminal failure.
    pub async fn settled(&self) -> Result<Value, PoolError> {
        let mut rx = self.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(PoolError::JobNotFound(self.id.clone())))
    }
}
