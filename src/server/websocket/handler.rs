//! WebSocket route handler.
//!
//! Handles authentication outcome, upgrade, message loop and cleanup. Client
//! sockets are routed into the jobs API; worker sockets additionally join the
//! pool as a [`WorkerHandle`].

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{
    connection::PeerConnection,
    messages::{msg_types, system, ClientMessage, ServerMessage},
};
use crate::api::{Ack, Route};
use crate::pool::{channels, Handshake, WorkerHandle};
use crate::server::auth::{Claims, ConnectionAuth, Role, TokenError};
use crate::server::server_version;
use crate::server::state::ServerState;

/// WebSocket upgrade handler for `GET /v1/ws`.
///
/// The socket is upgraded even when authentication failed, so the peer gets
/// an `error` frame explaining why it is being disconnected.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectionAuth(auth): ConnectionAuth,
    State(state): State<ServerState>,
) -> Response {
    match auth {
        Ok(claims) => {
            debug!("WebSocket upgrade for {} ({})", claims.sub, claims.role.as_str());
            ws.on_upgrade(move |socket| handle_socket(socket, claims, state))
        }
        Err(err) => {
            let grace = state.config.auth_grace;
            ws.on_upgrade(move |socket| reject_socket(socket, err, grace))
        }
    }
}

/// Tell the peer why it is rejected, then close. Unexpected failures get a
/// generic message and the close is held back by `grace`.
async fn reject_socket<S>(mut socket: S, err: TokenError, grace: Duration)
where
    S: Sink<Message> + Unpin,
{
    let frame = ServerMessage::new(msg_types::ERROR, err.payload());
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
    if !err.is_recognised() {
        warn!("Unexpected authentication failure: {}", err);
        tokio::time::sleep(grace).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// Handle an authenticated WebSocket connection.
async fn handle_socket(socket: WebSocket, claims: Claims, state: ServerState) {
    let (conn, outgoing_rx) = state
        .ws_connection_manager
        .register(claims.sub.clone(), claims.role)
        .await;
    info!(
        "WebSocket connected: {} as {} ({})",
        claims.sub,
        claims.role.as_str(),
        conn.id()
    );

    let (ws_sink, ws_stream) = socket.split();

    let connected_msg = ServerMessage::new(
        msg_types::CONNECTED,
        system::Connected {
            connection_id: conn.id().to_string(),
            role: claims.role.as_str().to_string(),
            server_version: server_version(),
        },
    );
    let outgoing_handle = tokio::spawn(forward_outgoing(ws_sink, outgoing_rx, connected_msg));

    let worker = match claims.role {
        Role::Worker => join_pool(&conn, &claims, &state).await,
        Role::Client => None,
    };

    process_incoming(ws_stream, &conn, &state).await;

    debug!("WebSocket disconnected: {} ({})", conn.subject(), conn.id());
    if let Some(worker) = worker {
        worker.send_kill_event().await;
        if let Err(e) = state.scheduler.remove_worker(worker.id()).await {
            debug!("Worker {} already gone from the pool: {}", worker.id(), e);
        }
    }
    let unanswered = conn.pending_requests();
    if unanswered > 0 {
        debug!("Dropping {} unanswered requests to {}", unanswered, conn.id());
    }
    // Fails whatever request the worker never answered
    conn.close();
    outgoing_handle.abort();
    state.ws_connection_manager.unregister(conn.id()).await;
}

async fn join_pool(
    conn: &Arc<PeerConnection>,
    claims: &Claims,
    state: &ServerState,
) -> Option<Arc<WorkerHandle>> {
    let worker = WorkerHandle::new(conn.id(), Handshake::new(&claims.sub), conn.clone());
    match state.scheduler.add_worker(Arc::clone(&worker)).await {
        Ok(()) => Some(worker),
        Err(e) => {
            error!("Could not add worker {} to the pool: {}", conn.id(), e);
            send_error(conn, e.code(), e.to_string()).await;
            None
        }
    }
}

/// Forward messages from the outgoing channel to the WebSocket.
async fn forward_outgoing(
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outgoing_rx: mpsc::Receiver<ServerMessage>,
    initial_msg: ServerMessage,
) {
    if let Ok(json) = serde_json::to_string(&initial_msg) {
        if ws_sink.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    while let Some(msg) = outgoing_rx.recv().await {
        match serde_json::to_string(&msg) {
            Ok(json) => {
                if ws_sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Failed to serialize WebSocket message: {}", e);
            }
        }
    }
}

async fn send_error(conn: &PeerConnection, code: &str, message: impl Into<String>) {
    let error_msg = ServerMessage::new(msg_types::ERROR, system::Error::new(code, message));
    let _ = conn.send(error_msg).await;
}

/// Process incoming messages from the WebSocket.
async fn process_incoming(
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    conn: &Arc<PeerConnection>,
    state: &ServerState,
) {
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    handle_client_message(msg, conn, state).await;
                }
                Err(e) => {
                    debug!("Failed to parse peer message: {}", e);
                    send_error(conn, "parse_error", format!("Invalid message format: {}", e))
                        .await;
                }
            },
            Ok(Message::Binary(_)) => {
                debug!("Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) => {
                // Axum/tungstenite handles pong automatically
                debug!("Received ping");
            }
            Ok(Message::Pong(_)) => {
                debug!("Received pong");
            }
            Ok(Message::Close(_)) => {
                debug!("Received close frame");
                break;
            }
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        }
    }
}

/// Handle a parsed peer message.
async fn handle_client_message(msg: ClientMessage, conn: &Arc<PeerConnection>, state: &ServerState) {
    match msg.msg_type.as_str() {
        msg_types::PING => {
            let _ = conn.send(ServerMessage::new(msg_types::PONG, system::Pong)).await;
        }
        msg_types::ACK => match msg.ack {
            Some(ack_id) => {
                if !conn.resolve_ack(ack_id, msg.payload) {
                    debug!("Ack {} from {} matches no pending request", ack_id, conn.id());
                }
            }
            None => send_error(conn, "ack_missing", "Ack frame without an ack id").await,
        },
        other if channels::is_job_channel(other) => {
            if !conn.deliver(other, msg.payload) {
                debug!("Nobody listens on {} for {}", other, conn.id());
            }
        }
        other => match state.jobs_api.route(other) {
            Some(route) if conn.role() == Role::Client => {
                handle_job_request(route, msg.payload, msg.ack, conn, state).await;
            }
            Some(_) => {
                warn!("Worker {} tried to call {}", conn.id(), other);
                send_error(conn, "forbidden", format!("{} is reserved to clients", other)).await;
            }
            None => {
                debug!("Unknown message type: {}", other);
                send_error(conn, "unknown_type", format!("Unknown message type: {}", other)).await;
            }
        },
    }
}

/// Bridge a client's `ack` id to the API's answer channel.
fn ack_forwarder(conn: &Arc<PeerConnection>, ack_id: u64) -> Ack {
    let (tx, rx) = oneshot::channel();
    let conn = Arc::clone(conn);
    tokio::spawn(async move {
        let Ok(payload) = rx.await else {
            return;
        };
        if let Err(e) = conn.send(ServerMessage::ack(ack_id, payload)).await {
            debug!("Could not deliver ack {} to {}: {}", ack_id, conn.id(), e);
        }
    });
    tx
}

async fn handle_job_request(
    route: Route,
    payload: serde_json::Value,
    ack_id: Option<u64>,
    conn: &Arc<PeerConnection>,
    state: &ServerState,
) {
    let ack = ack_id.map(|id| ack_forwarder(conn, id));
    if let Err(e) = state.jobs_api.handle(route, payload, ack).await {
        warn!("Request {:?} from {} refused: {}", route, conn.id(), e);
        send_error(conn, e.code(), e.to_string()).await;
    }
}
