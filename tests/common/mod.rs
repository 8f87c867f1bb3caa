//! Common test infrastructure
//!
//! This module provides all the infrastructure needed for end-to-end tests.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestServer, WsPeer, WS_TIMEOUT};
//! use podcast_pool_server::server::auth::Role;
//!
//! #[tokio::test]
//! async fn test_connect() {
//!     let server = TestServer::spawn().await;
//!     let token = server.token("client-1", Role::Client);
//!
//!     let mut client = WsPeer::connect(&server.base_url, Some(&token)).await;
//!     assert!(client.wait_for("connected", WS_TIMEOUT).await.is_some());
//! }
//! ```

mod client;
mod constants;
mod server;

// Public API - this is what tests import
#[allow(unused_imports)]
pub use client::{TestClient, WsPeer};
#[allow(unused_imports)]
pub use constants::*;
pub use server::TestServer;
