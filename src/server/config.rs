use super::RequestsLoggingLevel;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub requests_logging_level: RequestsLoggingLevel,
    pub port: u16,
    pub metrics_port: u16,
    /// Prefix of the job routes on the socket, e.g. `jobs` for `jobs/add`.
    pub route_prefix: String,
    /// Retry budget for submissions that don't set one.
    pub default_retries: u32,
    /// How long a socket with an unexpected authentication failure stays
    /// open after the error frame.
    pub auth_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            requests_logging_level: RequestsLoggingLevel::Path,
            port: 3002,
            metrics_port: 9092,
            route_prefix: "jobs".to_string(),
            default_retries: 0,
            auth_grace: Duration::from_millis(500),
        }
    }
}
