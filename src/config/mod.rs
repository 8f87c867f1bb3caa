mod file_config;

pub use file_config::FileConfig;

use crate::server::{RequestsLoggingLevel, ServerConfig};
use anyhow::{bail, Result};
use clap::ValueEnum;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SNAPSHOT_PATH: &str = "pool-snapshot.json";

/// Deployment flavour. Decides scheduling cadence and persistence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
    Test,
}

impl Environment {
    /// Minimum time between two scheduling passes.
    pub fn dispatch_interval(&self) -> Duration {
        match self {
            Environment::Production => Duration::from_millis(100),
            Environment::Development => Duration::from_millis(1000),
            Environment::Test => Duration::from_millis(10),
        }
    }

    pub fn snapshot_enabled(&self) -> bool {
        !matches!(self, Environment::Test)
    }
}

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub environment: Environment,
    pub snapshot_path: Option<PathBuf>,
    pub jwt_secret: Option<String>,
    pub default_retries: u32,
    pub route_prefix: String,
    pub auth_grace_ms: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            port: server.port,
            metrics_port: server.metrics_port,
            logging_level: server.requests_logging_level,
            environment: Environment::default(),
            snapshot_path: None,
            jwt_secret: None,
            default_retries: server.default_retries,
            route_prefix: server.route_prefix,
            auth_grace_ms: server.auth_grace.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub environment: Environment,
    pub snapshot_path: PathBuf,
    pub jwt_secret: String,
    pub default_retries: u32,
    pub route_prefix: String,
    pub auth_grace_ms: u64,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let jwt_secret = file
            .jwt_secret
            .or_else(|| cli.jwt_secret.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "jwt_secret must be specified via --jwt-secret, POOL_JWT_SECRET or in config file"
                )
            })?;

        let environment = match file.environment {
            Some(s) => match Environment::from_str(&s, true) {
                Ok(env) => env,
                Err(_) => bail!("Unknown environment in config file: {}", s),
            },
            None => cli.environment,
        };

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let snapshot_path = file
            .snapshot_path
            .map(PathBuf::from)
            .or_else(|| cli.snapshot_path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_PATH));

        let route_prefix = file
            .route_prefix
            .unwrap_or_else(|| cli.route_prefix.clone());
        if route_prefix.trim_matches('/').is_empty() {
            bail!("route_prefix must not be empty");
        }

        Ok(AppConfig {
            port: file.port.unwrap_or(cli.port),
            metrics_port: file.metrics_port.unwrap_or(cli.metrics_port),
            logging_level,
            environment,
            snapshot_path,
            jwt_secret,
            default_retries: file.default_retries.unwrap_or(cli.default_retries),
            route_prefix,
            auth_grace_ms: file.auth_grace_ms.unwrap_or(cli.auth_grace_ms),
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            requests_logging_level: self.logging_level.clone(),
            port: self.port,
            metrics_port: self.metrics_port,
            route_prefix: self.route_prefix.clone(),
            default_retries: self.default_retries,
            auth_grace: Duration::from_millis(self.auth_grace_ms),
        }
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}
