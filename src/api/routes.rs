//! Message routes clients use to talk to the pool.
//!
//! Routes live under a configurable prefix: with prefix `jobs` a client sends
//! `jobs/add` and `jobs/status` frames.

use super::controller::JobController;
use super::validation::validate_join_request;
use super::{Ack, ErrorPayload};
use crate::pool::{PoolError, SchedulerHandle};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Submit a join job. Answered when the job settles.
    Add,
    /// Current queue report.
    Status,
}

impl Route {
    fn suffix(&self) -> &'static str {
        match self {
            Route::Add => "add",
            Route::Status => "status",
        }
    }
}

pub struct JobsApi {
    routes: HashMap<String, Route>,
    controller: JobController,
    scheduler: SchedulerHandle,
}

impl JobsApi {
    pub fn new(prefix: &str, controller: JobController, scheduler: SchedulerHandle) -> Self {
        let prefix = prefix.trim_matches('/');
        let routes = [Route::Add, Route::Status]
            .into_iter()
            .map(|route| {
                let name = if prefix.is_empty() {
                    route.suffix().to_string()
                } else {
                    format!("{}/{}", prefix, route.suffix())
                };
                (name, route)
            })
            .collect();
        Self {
            routes,
            controller,
            scheduler,
        }
    }

    pub fn route(&self, msg_type: &str) -> Option<Route> {
        self.routes.get(msg_type).copied()
    }

    pub fn route_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Handle one routed request. Every route answers through `ack`, so a
    /// request without one is refused before anything happens.
    pub async fn handle(
        &self,
        route: Route,
        payload: Value,
        ack: Option<Ack>,
    ) -> Result<(), PoolError> {
        let ack = ack.ok_or(PoolError::AckMissing)?;

        match route {
            Route::Add => match validate_join_request(&payload) {
                Ok(request) => {
                    self.controller.add(request, ack).await;
                }
                Err(errors) => {
                    debug!("Rejected submission: {}", errors);
                    let _ = ack.send(ErrorPayload::bad_request(errors.to_string()).into_value());
                }
            },
            Route::Status => {
                let answer = match self.scheduler.report().await {
                    Ok(report) => serde_json::to_value(report).unwrap_or(Value::Null),
                    Err(e) => ErrorPayload::from_pool_error(&e).into_value(),
                };
                let _ = ack.send(answer);
            }
        }
        Ok(())
    }
}
