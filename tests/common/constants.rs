//! Shared constants for end-to-end tests
//!
//! This module contains all constants used across the test suite.
#![allow(dead_code)]

use std::time::Duration;

// ============================================================================
// Authentication
// ============================================================================

/// Secret the test server verifies tokens with
pub const TEST_JWT_SECRET: &str = "e2e-test-secret";

/// Lifetime of tokens minted by the harness
pub const TOKEN_TTL: Duration = Duration::from_secs(300);

/// Delay before a socket with an unexpected auth failure is dropped
pub const AUTH_GRACE_MS: u64 = 50;

// ============================================================================
// Submissions
// ============================================================================

/// Route prefix the test server is configured with
pub const ROUTE_PREFIX: &str = "jobs";

/// Valid 24-hex file ids
pub const FILE_1_ID: &str = "5f1b2c3d4e5f6a7b8c9d0e1f";
pub const FILE_2_ID: &str = "0a1b2c3d4e5f6a7b8c9d0e1f";

// ============================================================================
// Timeouts
// ============================================================================

/// Maximum time to wait for the server to become ready (milliseconds)
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

/// Interval between readiness checks (milliseconds)
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 20;

/// Default HTTP request timeout (seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 5;

/// How long to wait for an expected WebSocket frame
pub const WS_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to keep polling for an eventual condition
pub const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between queue report polls (milliseconds)
pub const REPORT_POLL_INTERVAL_MS: u64 = 20;
