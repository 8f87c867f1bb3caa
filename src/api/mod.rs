//! Job submission surface exposed to client connections.

pub mod controller;
pub mod join;
pub mod routes;
pub mod validation;

pub use controller::JobController;
pub use join::{register_join_action, JoinAction, JOIN_KIND};
pub use routes::{JobsApi, Route};
pub use validation::{validate_join_request, FileRef, FileType, JoinRequest, Seek};

use crate::pool::PoolError;
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

/// Answer channel for one client request. Answered at most once.
pub type Ack = oneshot::Sender<Value>;

/// Error body delivered through an [`Ack`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub status_code: u16,
    pub error: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(status_code: u16, message: impl Into<String>) -> Self {
        let error = StatusCode::from_u16(status_code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Error")
            .to_string();
        Self {
            status_code,
            error,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn from_pool_error(err: &PoolError) -> Self {
        Self::new(err.status_code(), err.to_string())
    }

    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
