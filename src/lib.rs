//! Podcast pool server library
//!
//! Job queue, worker pool and the WebSocket surface in front of them.
//! Exposed as a library for the binaries and the end-to-end tests.

pub mod api;
pub mod config;
pub mod pool;
pub mod server;

pub use pool::{create_scheduler, ActionRegistry, Job, PoolError, SchedulerHandle};
pub use server::{run_server, RequestsLoggingLevel};
