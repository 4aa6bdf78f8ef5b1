mod cli;
mod orchestrator;
mod worker;

use anyhow::{bail, Context, Result};
use clap::Parser;

use cli::Args;
use orchestrator::{RANK_ENV, WORLD_SIZE_ENV};

fn main() -> Result<()> {
    let args = Args::parse();
    match worker_identity()? {
        Some((rank, world_size)) => worker::run(rank, world_size, &args),
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .init();
            orchestrator::run(&args)
        }
    }
}

/// Rank identity handed down by the orchestrator; absent in the parent.
fn worker_identity() -> Result<Option<(usize, usize)>> {
    match (std::env::var(RANK_ENV), std::env::var(WORLD_SIZE_ENV)) {
        (Ok(rank), Ok(world_size)) => {
            let rank = rank
                .parse()
                .with_context(|| format!("{RANK_ENV} is not an integer: {rank:?}"))?;
            let world_size = world_size
                .parse()
                .with_context(|| format!("{WORLD_SIZE_ENV} is not an integer: {world_size:?}"))?;
            Ok(Some((rank, world_size)))
        }
        (Err(_), Err(_)) => Ok(None),
        _ => bail!("{RANK_ENV} and {WORLD_SIZE_ENV} must be set together"),
    }
}
