//! Message-level capability over one peer connection.
//!
//! Job actions talk to the worker executing them exclusively through this
//! trait, so the scheduler core never depends on the transport.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LinkError {
    #[error("Connection closed")]
    Closed,

    #[error("Request '{0}' was dropped before being acknowledged")]
    Dropped(String),
}

#[async_trait]
pub trait WorkerLink: Send + Sync {
    /// Whether messages can still be delivered to the peer.
    fn is_open(&self) -> bool;

    /// Send a message and wait for the peer to acknowledge it.
    async fn request(&self, msg_type: &str, payload: Value) -> Result<Value, LinkError>;

    /// Fire-and-forget send.
    async fn emit(&self, msg_type: &str, payload: Value) -> Result<(), LinkError>;

    /// Receive every message the peer sends on `channel` until unsubscribed.
    fn subscribe(&self, channel: &str) -> mpsc::UnboundedReceiver<Value>;

    fn unsubscribe(&self, channel: &str);
}

/// Channel names shared by the server and workers.
pub mod channels {
    /// Server -> worker job dispatch request.
    pub const JOIN: &str = "join";

    /// Worker -> server progress updates for one job.
    pub fn progress(job_id: &str) -> String {
        format!("job.{}.progress", job_id)
    }

    /// Server -> worker abort signal for one job.
    pub fn kill(job_id: &str) -> String {
        format!("job.{}.kill", job_id)
    }

    /// Whether a message type is addressed to a per-job channel.
    pub fn is_job_channel(msg_type: &str) -> bool {
        msg_type.starts_with("job.")
    }
}

#[cfg(test)]
mod tests {
    use super::channels;

    #[test]
    fn job_channels_are_derived_from_id() {
        assert_eq!(channels::progress("abc"), "job.abc.progress");
        assert_eq!(channels::kill("abc"), "job.abc.kill");
        assert!(channels::is_job_channel("job.abc.progress"));
        assert!(!channels::is_job_channel("jobs/add"));
    }
}
