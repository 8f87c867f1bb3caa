use super::join::JoinAction;
use super::validation::JoinRequest;
use super::{Ack, ErrorPayload};
use crate::pool::{Job, JobOptions, PoolError, SchedulerHandle};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns validated submissions into queued jobs.
#[derive(Clone)]
pub struct JobController {
    scheduler: SchedulerHandle,
    default_retries: u32,
}

impl JobController {
    pub fn new(scheduler: SchedulerHandle, default_retries: u32) -> Self {
        Self {
            scheduler,
            default_retries,
        }
    }

    fn build_job(&self, request: JoinRequest) -> Result<Arc<Job>, PoolError> {
        let retries = request.retries.unwrap_or(self.default_retries);
        let action = JoinAction::new(request.name, request.files);
        Job::new(
            Arc::new(action),
            JobOptions {
                priority: request.priority,
                retries: Some(i64::from(retries)),
                ..Default::default()
            },
        )
    }

    /// Queue a join job and answer `ack` once it settles.
    ///
    /// Failures to build or enqueue the job are answered as a 500 instead of
    /// being returned. Returns the id of the queued job.
    pub async fn add(&self, request: JoinRequest, ack: Ack) -> Option<String> {
        let job = match self.build_job(request) {
            Ok(job) => job,
            Err(e) => {
                warn!("Could not build job: {}", e);
                let _ = ack.send(ErrorPayload::internal(e.to_string()).into_value());
                return None;
            }
        };

        if let Err(e) = self.scheduler.add_job(Arc::clone(&job)).await {
            warn!("Could not enqueue job {}: {}", job.id(), e);
            let _ = ack.send(ErrorPayload::internal(e.to_string()).into_value());
            return None;
        }
        info!("Queued job {} (priority {})", job.id(), job.priority());

        let job_id = job.id().to_string();
        tokio::spawn(async move {
            let payload = match job.settled().await {
                Ok(value) => value,
                Err(e) => ErrorPayload::internal(e.to_string()).into_value(),
            };
            if ack.send(payload).is_err() {
                debug!("Submitter of job {} is gone", job.id());
            }
        });
        Some(job_id)
    }
}
