use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use podcast_pool_server::api::register_join_action;
use podcast_pool_server::config::{self, Environment};
use podcast_pool_server::pool::{
    create_scheduler, restore_jobs, stop_scheduler, ActionRegistry, JsonFileSnapshotStore, NoopSnapshotStore,
    SnapshotStore,
};
use podcast_pool_server::server::auth::TokenVerifier;
use podcast_pool_server::server::{metrics, run_server, RequestsLoggingLevel};

const SCHEDULER_STOP_GRACE: Duration = Duration::from_secs(5);

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3002)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9092)]
    pub metrics_port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Decides dispatch cadence and whether the queue is persisted.
    #[clap(long, value_enum, default_value = "production")]
    pub environment: Environment,

    /// Where the queue snapshot is kept.
    #[clap(long, value_parser = parse_path)]
    pub snapshot_path: Option<PathBuf>,

    /// Shared secret used to verify connection tokens.
    #[clap(long, env = "POOL_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Retry budget for submissions that don't specify one.
    #[clap(long, default_value_t = 0)]
    pub default_retries: u32,

    /// Prefix of the job routes clients call, e.g. `jobs` for `jobs/add`.
    #[clap(long, default_value = "jobs")]
    pub route_prefix: String,

    /// Delay before dropping a socket after an unexpected authentication failure.
    #[clap(long, default_value_t = 500)]
    pub auth_grace_ms: u64,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            port: args.port,
            metrics_port: args.metrics_port,
            logging_level: args.logging_level.clone(),
            environment: args.environment,
            snapshot_path: args.snapshot_path.clone(),
            jwt_secret: args.jwt_secret.clone(),
            default_retries: args.default_retries,
            route_prefix: args.route_prefix.clone(),
            auth_grace_ms: args.auth_grace_ms,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  environment: {:?}", app_config.environment);
    info!("  port: {}", app_config.port);
    info!("  route prefix: {}", app_config.route_prefix);

    info!("Initializing metrics...");
    metrics::init_metrics();

    let mut registry = ActionRegistry::new();
    register_join_action(&mut registry);
    info!("Restorable job kinds: {:?}", registry.kinds());

    let snapshot: Arc<dyn SnapshotStore> = if app_config.environment.snapshot_enabled() {
        info!("Queue snapshot at {:?}", app_config.snapshot_path);
        Arc::new(JsonFileSnapshotStore::new(app_config.snapshot_path.clone()))
    } else {
        info!("Queue snapshot disabled");
        Arc::new(NoopSnapshotStore)
    };
    let restored = restore_jobs(snapshot.load()?, &registry);

    let shutdown_token = CancellationToken::new();
    let (mut scheduler, scheduler_handle) = create_scheduler(
        snapshot,
        app_config.environment.dispatch_interval(),
        shutdown_token.clone(),
    );
    scheduler.restore(restored);
    info!("Restored {} queued jobs", scheduler.job_count());
    let mut scheduler_task = tokio::spawn(async move { scheduler.run().await });

    let token_verifier = TokenVerifier::new(&app_config.jwt_secret);

    info!("Ready to serve at port {}!", app_config.port);
    info!("Metrics available at port {}!", app_config.metrics_port);

    let result = tokio::select! {
        result = run_server(
            app_config.server_config(),
            scheduler_handle,
            token_verifier,
        ) => {
            info!("HTTP server stopped: {:?}", result);
            result
        },
        joined = &mut scheduler_task => {
            error!("Scheduler stopped unexpectedly: {:?}", joined);
            return Err(anyhow::anyhow!("scheduler stopped unexpectedly"));
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            Ok(())
        }
    };

    if !stop_scheduler(scheduler_task, &shutdown_token, SCHEDULER_STOP_GRACE).await {
        error!("Queue snapshot may be stale");
    }
    result
}
