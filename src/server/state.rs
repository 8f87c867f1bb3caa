use axum::extract::FromRef;

use crate::api::JobsApi;
use crate::pool::SchedulerHandle;
use std::sync::Arc;
use std::time::Instant;

use super::auth::TokenVerifier;
use super::websocket::ConnectionManager;
use super::ServerConfig;

pub type GuardedConnectionManager = Arc<ConnectionManager>;
pub type GuardedJobsApi = Arc<JobsApi>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub hash: String,
    pub scheduler: SchedulerHandle,
    pub ws_connection_manager: GuardedConnectionManager,
    pub token_verifier: TokenVerifier,
    pub jobs_api: GuardedJobsApi,
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for SchedulerHandle {
    fn from_ref(input: &ServerState) -> Self {
        input.scheduler.clone()
    }
}

impl FromRef<ServerState> for GuardedConnectionManager {
    fn from_ref(input: &ServerState) -> Self {
        input.ws_connection_manager.clone()
    }
}

impl FromRef<ServerState> for GuardedJobsApi {
    fn from_ref(input: &ServerState) -> Self {
        input.jobs_api.clone()
    }
}
