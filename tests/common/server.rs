//! Test server lifecycle management
//!
//! This module manages spawning and shutting down test HTTP servers.
//! Each test gets an isolated server with its own scheduler and empty queue.

use super::constants::*;
use chrono::Utc;
use podcast_pool_server::pool::{create_scheduler, NoopSnapshotStore};
use podcast_pool_server::server::auth::{Claims, Role, TokenVerifier};
use podcast_pool_server::server::{make_app, RequestsLoggingLevel, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Test server instance with its own scheduler
///
/// When dropped, the server and its scheduler shut down.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    verifier: TokenVerifier,

    // Private fields - keep resources alive until drop
    _scheduler_token: CancellationToken,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawns a new test server on a random port
    ///
    /// This function:
    /// 1. Starts a scheduler with persistence disabled and a 10ms cadence
    /// 2. Binds to a random port (127.0.0.1:0)
    /// 3. Spawns the server in a background task
    /// 4. Waits for the server to be ready
    ///
    /// # Panics
    ///
    /// Panics if port binding fails or the server doesn't become ready
    /// within timeout.
    pub async fn spawn() -> Self {
        let scheduler_token = CancellationToken::new();
        let (mut scheduler, scheduler_handle) = create_scheduler(
            Arc::new(NoopSnapshotStore),
            Duration::from_millis(10),
            scheduler_token.clone(),
        );
        tokio::spawn(async move { scheduler.run().await });

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");

        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let base_url = format!("http://127.0.0.1:{}", port);

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let config = ServerConfig {
            port,
            requests_logging_level: RequestsLoggingLevel::None,
            route_prefix: ROUTE_PREFIX.to_string(),
            default_retries: 0,
            auth_grace: Duration::from_millis(AUTH_GRACE_MS),
            ..Default::default()
        };

        let verifier = TokenVerifier::new(TEST_JWT_SECRET);
        let app =
            make_app(config, scheduler_handle, verifier.clone()).expect("Failed to build app");

        // Spawn server in background task with graceful shutdown
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            verifier,
            _scheduler_token: scheduler_token,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;

        server
    }

    /// Signs a valid token for `sub`
    pub fn token(&self, sub: &str, role: Role) -> String {
        self.verifier
            .issue(sub, role, TOKEN_TTL)
            .expect("Failed to sign token")
    }

    /// Signs a token that expired a minute ago
    pub fn expired_token(&self, sub: &str, role: Role) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            role,
            iat: now - 120,
            exp: now - 60,
        };
        self.verifier
            .encode(&claims)
            .expect("Failed to sign token")
    }

    /// Waits for the server to become ready by polling the home endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
        self._scheduler_token.cancel();
    }
}
