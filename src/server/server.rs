use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing::{debug, error, info};

use super::auth::{AuthClaims, TokenVerifier};
use super::metrics::metrics_handler;
use super::websocket::{ws_handler, ConnectionManager};
use super::{log_requests, server_version, state::*, ServerConfig};
use crate::api::{ErrorPayload, JobController, JobsApi};
use crate::pool::SchedulerHandle;

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub hash: String,
    pub version: String,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        hash: state.hash.clone(),
        version: server_version(),
    };
    Json(stats)
}

async fn get_queue(
    AuthClaims(claims): AuthClaims,
    State(scheduler): State<SchedulerHandle>,
) -> Response {
    debug!("Queue report requested by {}", claims.sub);
    match scheduler.report().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(ErrorPayload::from_pool_error(&e))).into_response()
        }
    }
}

impl ServerState {
    fn new(config: ServerConfig, scheduler: SchedulerHandle, token_verifier: TokenVerifier) -> Self {
        let controller = JobController::new(scheduler.clone(), config.default_retries);
        let jobs_api = JobsApi::new(&config.route_prefix, controller, scheduler.clone());
        ServerState {
            config,
            start_time: Instant::now(),
            hash: env!("GIT_HASH").to_owned(),
            scheduler,
            ws_connection_manager: Arc::new(ConnectionManager::new()),
            token_verifier,
            jobs_api: Arc::new(jobs_api),
        }
    }
}

pub fn make_app(
    config: ServerConfig,
    scheduler: SchedulerHandle,
    token_verifier: TokenVerifier,
) -> Result<Router> {
    let state = ServerState::new(config, scheduler, token_verifier);
    info!(
        "Job routes: {}",
        state.jobs_api.route_names().join(", ")
    );

    let app: Router = Router::new()
        .route("/", get(home))
        .route("/v1/ws", get(ws_handler))
        .route("/v1/queue", get(get_queue))
        .layer(middleware::from_fn_with_state(state.clone(), log_requests))
        .with_state(state);

    Ok(app)
}

pub async fn run_server(
    config: ServerConfig,
    scheduler: SchedulerHandle,
    token_verifier: TokenVerifier,
) -> Result<()> {
    let port = config.port;
    let metrics_port = config.metrics_port;
    let app = make_app(config, scheduler, token_verifier)?;

    let metrics_app = Router::new().route("/metrics", get(metrics_handler));
    let metrics_listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", metrics_port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", metrics_port))?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, metrics_app).await {
            error!("Metrics server stopped: {}", e);
        }
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;

    Ok(axum::serve(listener, app).await?)
}
