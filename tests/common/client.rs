//! HTTP and WebSocket clients for end-to-end tests
//!
//! When routes or frame formats change, update only this file.

use super::constants::*;
use futures::{SinkExt, StreamExt};
use http::header;
use reqwest::Response;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// HTTP test client for the pool's REST routes
pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    // ========================================================================
    // Public Endpoints
    // ========================================================================

    /// GET /
    pub async fn home(&self) -> Response {
        self.client
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .expect("Home request failed")
    }

    // ========================================================================
    // Authenticated Endpoints
    // ========================================================================

    /// GET /v1/queue, with the token as a bearer header when given
    pub async fn get_queue(&self, token: Option<&str>) -> Response {
        let mut request = self.client.get(format!("{}/v1/queue", self.base_url));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.expect("Queue request failed")
    }

    /// GET /v1/queue and decode the report
    ///
    /// # Panics
    ///
    /// Panics if the request is not answered with 200.
    pub async fn queue_report(&self, token: &str) -> Value {
        let response = self.get_queue(Some(token)).await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.expect("Queue report is not JSON")
    }

    /// Polls the queue report until `check` accepts it
    ///
    /// Returns None if that doesn't happen within `EVENTUALLY_TIMEOUT`.
    pub async fn wait_for_report<F>(&self, token: &str, check: F) -> Option<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < EVENTUALLY_TIMEOUT {
            let report = self.queue_report(token).await;
            if check(&report) {
                return Some(report);
            }
            tokio::time::sleep(Duration::from_millis(REPORT_POLL_INTERVAL_MS)).await;
        }
        None
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One side of a pool socket, acting as a client or a worker
pub struct WsPeer {
    stream: WsStream,
    next_ack: u64,
}

impl WsPeer {
    fn ws_url(base_url: &str) -> String {
        base_url.replace("http://", "ws://") + "/v1/ws"
    }

    async fn open(uri: String, token: Option<&str>) -> Self {
        let mut builder = http::Request::builder()
            .uri(&uri)
            .header(header::HOST, "localhost")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = builder.body(()).expect("Failed to build WebSocket request");

        let (stream, _) = connect_async(request)
            .await
            .expect("Failed to connect to WebSocket");

        Self { stream, next_ack: 1 }
    }

    /// Connects with the token in the Authorization header, or without any
    pub async fn connect(base_url: &str, token: Option<&str>) -> Self {
        Self::open(Self::ws_url(base_url), token).await
    }

    /// Connects with the token in the `token` query parameter
    pub async fn connect_with_query(base_url: &str, token: &str) -> Self {
        Self::open(format!("{}?token={}", Self::ws_url(base_url), token), None).await
    }

    /// Connects and waits for the `connected` frame
    pub async fn connected(base_url: &str, token: &str) -> Self {
        let mut peer = Self::connect(base_url, Some(token)).await;
        peer.wait_for("connected", WS_TIMEOUT)
            .await
            .expect("No connected frame");
        peer
    }

    /// Sends a raw frame
    pub async fn send(&mut self, msg_type: &str, payload: Value, ack: Option<u64>) {
        let mut frame = json!({ "type": msg_type, "payload": payload });
        if let Some(ack) = ack {
            frame["ack"] = json!(ack);
        }
        self.stream
            .send(Message::Text(frame.to_string().into()))
            .await
            .expect("Failed to send frame");
    }

    /// Sends a frame expecting an answer and returns its ack id
    pub async fn request(&mut self, msg_type: &str, payload: Value) -> u64 {
        let ack = self.next_ack;
        self.next_ack += 1;
        self.send(msg_type, payload, Some(ack)).await;
        ack
    }

    /// Answers a server request, the way a worker acknowledges a job
    pub async fn answer(&mut self, ack: u64, payload: Value) {
        self.send("ack", payload, Some(ack)).await;
    }

    /// Next text frame, skipping control frames; None once the socket closes
    pub async fn next_frame(&mut self, timeout_duration: Duration) -> Option<Value> {
        let result = timeout(timeout_duration, async {
            while let Some(Ok(msg)) = self.stream.next().await {
                match msg {
                    Message::Text(text) => {
                        if let Ok(json) = serde_json::from_str::<Value>(&text) {
                            return Some(json);
                        }
                    }
                    Message::Close(_) => return None,
                    _ => {}
                }
            }
            None
        })
        .await;

        result.ok().flatten()
    }

    /// Waits for a specific frame type, dropping anything else
    pub async fn wait_for(&mut self, expected_type: &str, timeout_duration: Duration) -> Option<Value> {
        let result = timeout(timeout_duration, async {
            loop {
                let frame = self.next_frame(timeout_duration).await?;
                if frame.get("type").and_then(|t| t.as_str()) == Some(expected_type) {
                    return Some(frame);
                }
            }
        })
        .await;

        result.ok().flatten()
    }

    /// Waits for the answer to the request sent with `ack`
    pub async fn wait_for_ack(&mut self, ack: u64, timeout_duration: Duration) -> Option<Value> {
        let result = timeout(timeout_duration, async {
            loop {
                let frame = self.wait_for("ack", timeout_duration).await?;
                if frame.get("ack").and_then(|a| a.as_u64()) == Some(ack) {
                    return frame.get("payload").cloned();
                }
            }
        })
        .await;

        result.ok().flatten()
    }

    /// Whether the server closes the socket within `timeout_duration`
    pub async fn is_closed_within(&mut self, timeout_duration: Duration) -> bool {
        let result = timeout(timeout_duration, async {
            while let Some(msg) = self.stream.next().await {
                match msg {
                    Ok(Message::Close(_)) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await;

        result.is_ok()
    }

    /// Closes the socket from this side
    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
