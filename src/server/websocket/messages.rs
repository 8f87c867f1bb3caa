//! WebSocket message types.
//!
//! Every frame in either direction uses the same envelope. Requests that
//! expect an answer carry an `ack` id; the answer comes back as an `ack`
//! frame carrying the same id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server -> peer message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerMessage {
    /// Message type identifier (e.g. "connected", "join", "job.<id>.kill")
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: Value,
    /// Present on requests awaiting an answer, and on answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl ServerMessage {
    /// Create a new server message with the given type and payload.
    pub fn new(msg_type: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            ack: None,
        }
    }

    /// Answer to a peer request carrying `ack` id `id`.
    pub fn ack(id: u64, payload: Value) -> Self {
        Self {
            msg_type: msg_types::ACK.to_string(),
            payload,
            ack: Some(id),
        }
    }

    pub fn with_ack(mut self, id: u64) -> Self {
        self.ack = Some(id);
        self
    }
}

/// Peer -> server message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub ack: Option<u64>,
}

/// System-level messages (not feature-specific).
pub mod system {
    use serde::{Deserialize, Serialize};

    /// Sent immediately after an authenticated connection is established.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Connected {
        pub connection_id: String,
        pub role: String,
        pub server_version: String,
    }

    /// Heartbeat response (server -> peer).
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Pong;

    /// Sent when the server cannot process a peer message.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct Error {
        pub code: String,
        pub message: String,
    }

    impl Error {
        pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
            Self {
                code: code.into(),
                message: message.into(),
            }
        }
    }
}

/// Reserved message type constants.
pub mod msg_types {
    /// Sent by server on successful connection.
    pub const CONNECTED: &str = "connected";
    /// Peer heartbeat request.
    pub const PING: &str = "ping";
    /// Server heartbeat response.
    pub const PONG: &str = "pong";
    /// Error frame, including authentication failures.
    pub const ERROR: &str = "error";
    /// Answer to a request carrying an ack id, in either direction.
    pub const ACK: &str = "ack";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_message_serializes_without_ack() {
        let msg = ServerMessage::new("test_type", json!({"key": "value"}));
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"type\":\"test_type\""));
        assert!(json.contains("\"payload\":{\"key\":\"value\"}"));
        assert!(!json.contains("\"ack\""));
    }

    #[test]
    fn ack_reply_carries_id() {
        let msg = ServerMessage::ack(7, json!({"statusCode": 200}));
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value, json!({"type": "ack", "ack": 7, "payload": {"statusCode": 200}}));
    }

    #[test]
    fn client_message_deserializes_without_payload_or_ack() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();

        assert_eq!(msg.msg_type, "ping");
        assert_eq!(msg.payload, Value::Null);
        assert_eq!(msg.ack, None);
    }

    #[test]
    fn client_message_reads_ack() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"jobs/add","ack":3,"payload":{"name":"x"}}"#).unwrap();

        assert_eq!(msg.ack, Some(3));
        assert_eq!(msg.payload["name"], "x");
    }

    #[test]
    fn system_error_serializes_correctly() {
        let error = system::Error::new("parse_error", "Could not parse message");
        let msg = ServerMessage::new(msg_types::ERROR, &error);
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"parse_error\""));
    }
}
