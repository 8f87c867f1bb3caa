//! Mints connection tokens for clients and workers.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;

use podcast_pool_server::server::auth::{Role, TokenVerifier};

#[derive(Parser, Debug)]
#[clap(about = "Issue a signed token for the podcast pool")]
struct CliArgs {
    /// Subject the token is issued to, e.g. the worker's host name.
    pub sub: String,

    /// What the holder may do.
    #[clap(long, value_enum, default_value = "client")]
    pub role: Role,

    /// Lifetime in seconds.
    #[clap(long, default_value_t = 3600)]
    pub ttl_sec: u64,

    /// Shared secret; must match the server's.
    #[clap(long, env = "POOL_JWT_SECRET", hide_env_values = true)]
    pub secret: String,
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let verifier = TokenVerifier::new(&args.secret);
    let token = verifier
        .issue(&args.sub, args.role, Duration::from_secs(args.ttl_sec))
        .context("Failed to sign token")?;

    println!("{}", token);
    Ok(())
}
