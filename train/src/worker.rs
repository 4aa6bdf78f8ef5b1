//! Per-rank worker: builds every component for its device, joins the
//! collective group, runs all epochs, tears the group down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tch::Device;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use clasp_collective::{coordinator_addr_from_env, ProcessGroup};
use clasp_core::{RunConfig, RunPaths, WorkerId};
use clasp_modeling::{
    AdamW, BatchProvider, Checkpointer, Clip, Communicator, ContrastiveModel, CoordinatorIo,
    EpochRunner, ForwardFlags, MetricsWriter, ProfileSchedule, SafetensorsShard, StepProfiler,
    SyntheticShard, Tokenizer, DATA_EPOCH_ENV,
};

use crate::cli::Args;

const JOIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Shard length when no data directory is configured and synthetic batches
/// stand in for the streaming pipeline.
const SYNTHETIC_BATCHES_PER_EPOCH: usize = 8;

pub fn run(rank: usize, world_size: usize, args: &Args) -> Result<()> {
    let config = args.to_run_config();
    let worker = WorkerId { rank, world_size };
    let role = worker.role();

    let paths = RunPaths::new(&config.path_results, &config.run_id);
    paths.create_all().context("creating run directories")?;
    init_logging(&paths)?;

    info!(rank, world_size, %role, "worker starting");
    if role.is_coordinator() {
        info!(?config, "run configuration");
    }

    let device = args
        .device
        .device_for_rank(rank)
        .with_context(|| format!("no device for rank {rank} (devices: {})", args.device))?;

    let addr = coordinator_addr_from_env()?;
    info!(rank, %addr, "joining collective group");
    let group = ProcessGroup::join(rank, world_size, addr, JOIN_TIMEOUT)
        .context("collective group setup failed")?;
    let comm = Arc::new(Communicator::new(group));
    info!(rank, "collective group ready");

    // teardown runs exactly once, on the failure path as well
    let outcome = train(&config, &paths, worker, device, comm.clone());
    let teardown = comm.cleanup();
    outcome?;
    teardown.context("collective group teardown failed")?;
    info!(rank, "training finished");
    Ok(())
}

fn train(
    config: &RunConfig,
    paths: &RunPaths,
    worker: WorkerId,
    device: Device,
    comm: Arc<Communicator>,
) -> Result<()> {
    let role = worker.role();
    let tokenizer = Tokenizer::new();

    let mut model = Clip::new(
        device,
        &config.model,
        &config.flags,
        tokenizer.vocab_size(),
        Some(comm.clone()),
    )
    .context("building model")?;
    if let Some(weights) = &config.path_weights {
        model
            .load_weights(weights)
            .with_context(|| format!("reloading weights from {}", weights.display()))?;
        info!(rank = worker.rank, path = %weights.display(), "reloaded model weights");
    }

    let vars = model.variables();
    let param_bytes: u64 = vars
        .iter()
        .map(|(_, t)| t.size().iter().product::<i64>() as u64 * 4)
        .sum();
    let optimizer = AdamW::new(&vars, config.lr).context("building optimizer")?;
    info!(
        rank = worker.rank,
        parameters = vars.len(),
        param_bytes,
        "model and optimizer ready"
    );

    let mut data: Box<dyn BatchProvider> = match &config.path_data_train {
        Some(dir) => Box::new(
            SafetensorsShard::from_dir(dir, worker.rank, worker.world_size)
                .context("opening training shard")?,
        ),
        None => Box::new(SyntheticShard::new(
            &config.model,
            config.batch_size,
            tokenizer.vocab_size(),
            SYNTHETIC_BATCHES_PER_EPOCH,
            worker.rank,
        )),
    };

    // the single decision point for coordinator-only I/O
    let coordinator = if role.is_coordinator() {
        Some(CoordinatorIo {
            writer: MetricsWriter::create(&paths.tb_dir).context("creating metrics writer")?,
            checkpointer: Checkpointer::new(
                &paths.model_dir,
                config.save_interval_step,
                config.save_interval_epoch,
            ),
        })
    } else {
        None
    };
    let profiler = config.tb_profiler.then(|| {
        StepProfiler::new(
            &paths.tb_dir,
            worker.rank,
            param_bytes,
            ProfileSchedule::default(),
        )
    });

    let flags = ForwardFlags {
        return_loss: true,
        freeze_image_encoder: config.freeze_image_encoder,
        text_to_image: config.text_to_image,
    };
    let mut runner = EpochRunner::new(
        Box::new(model),
        optimizer,
        Some(comm),
        worker,
        flags,
        config.clip_grad_norm,
        config.dryrun,
        coordinator,
        profiler,
    );

    for epoch in 0..config.epochs {
        // the streaming dataset reads its shard epoch from this variable
        std::env::set_var(DATA_EPOCH_ENV, epoch.to_string());
        let summary = runner.run_epoch(epoch, data.as_mut())?;
        debug!(
            rank = worker.rank,
            epoch,
            batches = summary.batches,
            loss = summary.loss_avg,
            "epoch finished"
        );
    }
    Ok(())
}

/// Console at the env-filtered level (info by default), the run's log file
/// at debug. Every rank appends to the run log so all ranks stay
/// debuggable from one file.
fn init_logging(paths: &RunPaths) -> Result<()> {
    let file_name = format!(
        "train_{}.log",
        OffsetDateTime::now_utc().format(format_description!(
            "[year]-[month]-[day]_[hour]-[minute]-[second]"
        ))?
    );
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.run_dir.join(file_name))?;

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .with_filter(LevelFilter::DEBUG),
        )
        .with(tracing_subscriber::fmt::layer().with_filter(console_filter))
        .try_init()
        .ok();
    Ok(())
}
