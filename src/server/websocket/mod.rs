//! WebSocket surface shared by clients and workers.

pub mod connection;
pub mod handler;
pub mod messages;

pub use connection::{ConnectionManager, PeerConnection};
pub use handler::ws_handler;
