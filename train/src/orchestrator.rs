//! Spawns and supervises one worker process per device.

use std::ffi::OsString;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::cli::Args;

pub const RANK_ENV: &str = "CLASP_RANK";
pub const WORLD_SIZE_ENV: &str = "CLASP_WORLD_SIZE";

pub fn run(args: &Args) -> Result<()> {
    let devices = args.device.clone();
    let world_size = args.workers.unwrap_or_else(|| devices.size());
    if world_size < 2 {
        bail!(
            "data-parallel training requires at least 2 workers, got {world_size} \
             (devices: {devices}); pass `--device cpu --workers N` to run CPU replicas"
        );
    }
    for rank in 0..world_size {
        if devices.device_for_rank(rank).is_none() {
            bail!("no device available for rank {rank} (devices: {devices})");
        }
    }

    let exe = std::env::current_exe().context("resolving current executable")?;
    let argv: Vec<OsString> = std::env::args_os().skip(1).collect();

    info!(world_size, %devices, "spawning workers");
    let mut children = Vec::with_capacity(world_size);
    for rank in 0..world_size {
        let child = Command::new(&exe)
            .args(&argv)
            .env(RANK_ENV, rank.to_string())
            .env(WORLD_SIZE_ENV, world_size.to_string())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn worker for rank {rank}"))?;
        children.push((rank, child));
    }

    let mut failures = Vec::new();
    for (rank, mut child) in children {
        let status = child
            .wait()
            .with_context(|| format!("waiting for rank {rank}"))?;
        if status.success() {
            info!(rank, "worker exited cleanly");
        } else {
            failures.push((rank, status));
        }
    }
    if !failures.is_empty() {
        bail!("worker(s) failed: {failures:?}");
    }
    Ok(())
}
