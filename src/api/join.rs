//! The podcast join action: asks a worker to stitch files into one episode.

use super::validation::FileRef;
use crate::pool::{channels, ActionFuture, ActionRegistry, Job, JobAction, JobFailure, WorkerLink};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const JOIN_KIND: &str = "join";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinParams {
    pub name: String,
    pub files: Vec<FileRef>,
}

pub struct JoinAction {
    params: JoinParams,
}

impl JoinAction {
    pub fn new(name: impl Into<String>, files: Vec<FileRef>) -> Self {
        Self {
            params: JoinParams {
                name: name.into(),
                files,
            },
        }
    }

    pub fn from_params(params: JoinParams) -> Self {
        Self { params }
    }
}

fn apply_progress(job: &Job, update: &Value) {
    let Some(percent) = update.get("percent").and_then(Value::as_f64) else {
        debug!("Ignoring progress update without percent for job {}", job.id());
        return;
    };
    if let Err(e) = job.set_progress(percent.round() as i64) {
        warn!("Bad progress from worker for job {}: {}", job.id(), e);
    }
}

/// Map the worker's answer to the attempt outcome. Anything but a 2xx
/// `statusCode` is a failure.
fn check_reply(reply: Value) -> Result<Value, JobFailure> {
    let Some(code) = reply.get("statusCode").and_then(Value::as_u64) else {
        return Err(JobFailure::new("Worker answered join without a statusCode"));
    };
    if (200..300).contains(&code) {
        return Ok(reply);
    }
    let message = reply
        .get("message")
        .or_else(|| reply.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("no message");
    Err(JobFailure::new(format!(
        "Worker rejected join with status {}: {}",
        code, message
    )))
}

impl JobAction for JoinAction {
    fn kind(&self) -> &str {
        JOIN_KIND
    }

    fn params(&self) -> Value {
        serde_json::to_value(&self.params).unwrap_or(Value::Null)
    }

    fn run(&self, job: Arc<Job>, link: Arc<dyn WorkerLink>) -> ActionFuture {
        let params = self.params.clone();
        async move {
            let progress_channel = channels::progress(job.id());
            let mut progress = link.subscribe(&progress_channel);

            let payload = json!({
                "jobId": job.id(),
                "name": params.name,
                "files": params.files,
            });
            let mut request = link.request(channels::JOIN, payload);

            let reply = loop {
                tokio::select! {
                    reply = &mut request => break reply,
                    Some(update) = progress.recv() => apply_progress(&job, &update),
                }
            };
            drop(request);
            link.unsubscribe(&progress_channel);

            check_reply(reply?)
        }
        .boxed()
    }
}

/// Make join jobs restorable from snapshots.
pub fn register_join_action(registry: &mut ActionRegistry) {
    registry.register(JOIN_KIND, |params| {
        let params: JoinParams = serde_json::from_value(params).map_err(|e| e.to_string())?;
        Ok(Arc::new(JoinAction::from_params(params)) as Arc<dyn JobAction>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::validation::FileType;
    use crate::pool::testing::FakeLink;
    use crate::pool::{JobOptions, JobStatus, LinkError, PoolError};
    use std::time::Duration;

    const FILE_ID: &str = "bbbbbbbbbbbbbbbbbbbbbbbb";

    fn join_job(retries: i64) -> Arc<Job> {
        let action = JoinAction::new(
            "episode-3",
            vec![FileRef {
                id: FILE_ID.to_string(),
                file_type: FileType::PodcastPart,
                seek: None,
            }],
        );
        Job::new(
            Arc::new(action),
            JobOptions {
                retries: Some(retries),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn sends_join_request_and_resolves_on_success() {
        let job = join_job(0);
        let link = FakeLink::open();

        let value = job.start(link.clone()).await.unwrap();

        assert_eq!(value, json!({"statusCode": 200}));
        let requests = link.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "join");
        assert_eq!(
            requests[0].1,
            json!({
                "jobId": job.id(),
                "name": "episode-3",
                "files": [{"id": FILE_ID, "type": "podcast-part"}]
            })
        );
        assert!(!link.is_subscribed(&channels::progress(job.id())));
    }

    #[tokio::test]
    async fn progress_updates_reach_the_job() {
        let job = join_job(0);
        let link = FakeLink::open();
        let gate = link.gate_next_reply();

        let attempt = tokio::spawn(job.start(link.clone()));
        let channel = channels::progress(job.id());
        for _ in 0..50 {
            if link.is_subscribed(&channel) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(link.push(&channel, json!({"percent": 42.4})));
        for _ in 0..50 {
            if job.progress() == 42 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(job.progress(), 42);

        gate.send(()).unwrap();
        attempt.await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Done);
    }

    #[tokio::test]
    async fn non_success_status_fails_the_attempt() {
        let job = join_job(1);
        let link = FakeLink::open();
        link.reply_with(Ok(json!({"statusCode": 500, "message": "ffmpeg crashed"})));

        let err = job.start(link).await.unwrap_err();

        assert!(matches!(err, PoolError::JobWillRetry { retries_left: 0, .. }));
        assert_eq!(job.status(), JobStatus::Waiting);
    }

    #[tokio::test]
    async fn dropped_link_fails_the_attempt() {
        let job = join_job(0);
        let link = FakeLink::open();
        link.reply_with(Err(LinkError::Dropped("join".to_string())));

        let err = job.start(link).await.unwrap_err();

        match err {
            PoolError::JobFailed { reason, .. } => assert!(reason.contains("dropped")),
            other => panic!("expected JobFailed, got {:?}", other),
        }
    }

    #[test]
    fn reply_without_status_is_a_failure() {
        assert!(check_reply(json!({"ok": true})).is_err());
        assert!(check_reply(json!({"statusCode": 204})).is_ok());
    }

    #[test]
    fn registry_rebuilds_join_actions() {
        let mut registry = ActionRegistry::new();
        register_join_action(&mut registry);

        let job = join_job(2);
        let restored = Job::create(None, job.options(), &registry).unwrap();

        assert_eq!(restored.kind(), JOIN_KIND);
        assert_eq!(restored.options().params, job.options().params);
        assert!(registry.build(JOIN_KIND, json!({"name": 3})).is_err());
    }
}
