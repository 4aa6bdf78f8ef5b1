//! The distributed training loop.
//!
//! One `EpochRunner` per worker process drives forward/backward/step over
//! that rank's data shard. Collective calls (barrier, gradient sync, metric
//! reduction) happen in a fixed per-batch order, and the batch loop is
//! bounded before it starts with a length every rank computes identically:
//! the two properties that keep the group's collective sequences aligned.

use std::sync::Arc;
use std::time::Instant;

use tch::TchError;
use thiserror::Error;
use tracing::{debug, info};

use clasp_core::{AverageMeter, WorkerId};
use clasp_collective::CollectiveError;

use crate::checkpoint::{CheckpointError, CheckpointTag, Checkpointer};
use crate::contrastive::{ContrastiveModel, ForwardFlags};
use crate::data::{BatchProvider, DataError};
use crate::metrics::MetricsWriter;
use crate::optimizer::{clip_global_grad_norm, grad_norm_sum, AdamW};
use crate::parallelism::{reduce_mean_scalar, sync_gradients, Communicator, SyncError};
use crate::profiler::{ProfilerError, StepProfiler};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Collective(#[from] CollectiveError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Profiler(#[from] ProfilerError),

    #[error("optimizer failure: {0}")]
    Torch(#[from] TchError),

    #[error("failed to record metrics: {0}")]
    Metrics(#[from] std::io::Error),

    #[error("model returned no loss from a return_loss forward pass")]
    NoLoss,
}

/// I/O facilities only the coordinator rank owns. Constructing this for a
/// non-coordinator rank is the one mistake the `Role` gating exists to
/// prevent; the worker builds it exactly once, behind `is_coordinator`.
#[derive(Debug)]
pub struct CoordinatorIo {
    pub writer: MetricsWriter,
    pub checkpointer: Checkpointer,
}

/// Aggregate view of one finished epoch.
#[derive(Debug, Clone, Copy)]
pub struct EpochSummary {
    pub epoch: usize,
    pub batches: usize,
    pub loss_avg: f64,
    pub data_time_avg: f64,
    pub batch_time_avg: f64,
    pub epoch_time: f64,
}

/// Drives one pass over the training shard per `run_epoch` call.
pub struct EpochRunner {
    model: Box<dyn ContrastiveModel>,
    optimizer: AdamW,
    comm: Option<Arc<Communicator>>,
    worker: WorkerId,
    flags: ForwardFlags,
    clip_grad_norm: Option<f64>,
    dryrun: Option<usize>,
    coordinator: Option<CoordinatorIo>,
    profiler: Option<StepProfiler>,

    step: u64,
    losses: AverageMeter,
    data_time: AverageMeter,
    batch_time: AverageMeter,
}

impl EpochRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Box<dyn ContrastiveModel>,
        optimizer: AdamW,
        comm: Option<Arc<Communicator>>,
        worker: WorkerId,
        flags: ForwardFlags,
        clip_grad_norm: Option<f64>,
        dryrun: Option<usize>,
        coordinator: Option<CoordinatorIo>,
        profiler: Option<StepProfiler>,
    ) -> Self {
        Self {
            model,
            optimizer,
            comm,
            worker,
            flags,
            clip_grad_norm,
            dryrun,
            coordinator,
            profiler,
            step: 0,
            losses: AverageMeter::new(),
            data_time: AverageMeter::new(),
            batch_time: AverageMeter::new(),
        }
    }

    /// Batches processed so far, across epochs. Monotonic for the lifetime
    /// of the process; not recoverable across restarts.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn model(&self) -> &dyn ContrastiveModel {
        self.model.as_ref()
    }

    pub fn run_epoch(
        &mut self,
        epoch: usize,
        data: &mut dyn BatchProvider,
    ) -> Result<EpochSummary, TrainError> {
        let epoch_start = Instant::now();
        self.losses.reset();
        self.data_time.reset();
        self.batch_time.reset();

        data.begin_epoch(epoch)?;
        // Bounded before the loop begins, from inputs every rank shares: a
        // runtime break at different iteration counts would desynchronize
        // the group's collective call sequence and deadlock it.
        let batches = match self.dryrun {
            Some(limit) => data.batches_per_epoch().min(limit),
            None => data.batches_per_epoch(),
        };
        debug!(rank = self.worker.rank, epoch, batches, "epoch starting");

        if let Some(profiler) = self.profiler.as_mut() {
            profiler.start(epoch);
        }

        let device = self.model.device();
        let mut previous_batch_end = Instant::now();
        for _ in 0..batches {
            self.optimizer.zero_grad()?;

            let batch = data.next_batch()?;
            let data_wait =
                reduce_mean_scalar(previous_batch_end.elapsed().as_secs_f64(), &self.comm)?;
            self.data_time.update(data_wait, 1);

            let batch = batch.to_device(device);
            let (_, loss) = self.model.forward(
                &batch.token_ids,
                &batch.images,
                batch.token_mask.as_ref(),
                self.flags,
            );
            let loss = loss.ok_or(TrainError::NoLoss)?;

            // every rank must finish its forward before any rank starts
            // backward: the forward is dynamic-shape-sensitive
            if let Some(comm) = &self.comm {
                comm.barrier()?;
            }
            loss.backward();

            let vars = self.model.variables();
            sync_gradients(&vars, &self.comm)?;
            if let Some(max_norm) = self.clip_grad_norm {
                clip_global_grad_norm(&vars, max_norm);
            }
            if let Some(io) = self.coordinator.as_mut() {
                // gradients are synchronized, rank 0 stands for all ranks
                io.writer
                    .add_scalar("grad/l2_norm_sum", grad_norm_sum(&vars), self.step)?;
            }

            self.optimizer.step()?;
            self.clamp_temperature();

            let loss_value = reduce_mean_scalar(loss.double_value(&[]), &self.comm)?;
            self.losses.update(loss_value, 1);

            if let Some(profiler) = self.profiler.as_mut() {
                profiler.step(self.step);
            }

            let batch_elapsed =
                reduce_mean_scalar(previous_batch_end.elapsed().as_secs_f64(), &self.comm)?;
            self.batch_time.update(batch_elapsed, 1);

            if let Some(io) = self.coordinator.as_mut() {
                io.writer.add_scalar("loss/step", loss_value, self.step)?;
                io.writer.add_scalar(
                    "temperature/step",
                    self.model.temperature().double_value(&[0]),
                    self.step,
                )?;
                io.writer
                    .add_scalar("timings/data_s", data_wait, self.step)?;
                io.writer
                    .add_scalar("timings/batch_s", batch_elapsed, self.step)?;

                if io.checkpointer.should_save_step(self.step) {
                    let path = io.checkpointer.save(&vars, CheckpointTag::Step(self.step))?;
                    info!(
                        epoch,
                        step = self.step,
                        loss = self.losses.avg(),
                        bt = self.batch_time.avg(),
                        dt = self.data_time.avg(),
                        path = %path.display(),
                        "saved step checkpoint"
                    );
                }
            }

            self.step += 1;
            previous_batch_end = Instant::now();
        }

        // stopped on every path out of the batch loop, dryrun included
        if let Some(profiler) = self.profiler.as_mut() {
            let path = profiler.stop()?;
            debug!(path = %path.display(), "profiler trace written");
        }

        let epoch_time = reduce_mean_scalar(epoch_start.elapsed().as_secs_f64(), &self.comm)?;
        if let Some(io) = self.coordinator.as_mut() {
            io.writer
                .add_scalar("loss/epoch", self.losses.avg(), epoch as u64)?;
            io.writer
                .add_scalar("timings/epoch_s", epoch_time, epoch as u64)?;
            io.writer
                .add_scalar("timings/data_avg_s", self.data_time.avg(), epoch as u64)?;
            io.writer
                .add_scalar("timings/batch_avg_s", self.batch_time.avg(), epoch as u64)?;

            if io.checkpointer.should_save_epoch(epoch) {
                let vars = self.model.variables();
                let path = io.checkpointer.save(&vars, CheckpointTag::Epoch(epoch))?;
                info!(
                    epoch,
                    et = epoch_time,
                    bt = self.batch_time.avg(),
                    dt = self.data_time.avg(),
                    loss = self.losses.avg(),
                    path = %path.display(),
                    "saved epoch checkpoint"
                );
            }
        }

        self.run_validation(epoch);

        Ok(EpochSummary {
            epoch,
            batches,
            loss_avg: self.losses.avg(),
            data_time_avg: self.data_time.avg(),
            batch_time_avg: self.batch_time.avg(),
            epoch_time,
        })
    }

    /// Keep the contrastive softmax temperature in a numerically stable
    /// band after each optimizer step.
    fn clamp_temperature(&mut self) {
        let _guard = tch::no_grad_guard();
        let bound = 100f64.ln();
        let mut temperature = self.model.temperature();
        let _ = temperature.clamp_(-bound, bound);
    }

    fn run_validation(&mut self, epoch: usize) {
        // distributed validation is deferred; the call site stays so the
        // cadence is visible in traces
        debug!(epoch, "validation pass skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticShard;
    use crate::metrics::load_scalars;
    use crate::models::Clip;
    use crate::profiler::ProfileSchedule;
    use clasp_core::{ModelDims, ModelFlags};
    use std::path::Path;
    use tch::{Device, Tensor};

    fn tiny_dims() -> ModelDims {
        ModelDims {
            dim_text: 16,
            dim_image: 16,
            dim_latent: 8,
            num_visual_tokens: 16,
            text_enc_depth: 1,
            text_seq_len: 8,
            text_heads: 2,
            visual_enc_depth: 1,
            visual_heads: 2,
            visual_image_size: 16,
            visual_patch_size: 8,
            channels: 3,
        }
    }

    fn tiny_runner(
        run_dir: &Path,
        dryrun: Option<usize>,
        with_profiler: bool,
        save_interval_step: usize,
    ) -> (EpochRunner, SyntheticShard) {
        let dims = tiny_dims();
        let model = Clip::new(Device::Cpu, &dims, &ModelFlags::default(), 64, None).unwrap();
        let optimizer = AdamW::new(&model.variables(), 1e-3).unwrap();

        let tb_dir = run_dir.join("tb");
        let model_dir = run_dir.join("model");
        std::fs::create_dir_all(&tb_dir).unwrap();
        std::fs::create_dir_all(&model_dir).unwrap();

        let coordinator = CoordinatorIo {
            writer: MetricsWriter::create(&tb_dir).unwrap(),
            checkpointer: Checkpointer::new(&model_dir, save_interval_step, 1),
        };
        let profiler = with_profiler.then(|| {
            StepProfiler::new(&tb_dir, 0, 0, ProfileSchedule::default())
        });

        let runner = EpochRunner::new(
            Box::new(model),
            optimizer,
            None,
            WorkerId {
                rank: 0,
                world_size: 1,
            },
            ForwardFlags::default(),
            Some(1.0),
            dryrun,
            Some(coordinator),
            profiler,
        );
        let shard = SyntheticShard::new(&dims, 2, 64, 5, 0);
        (runner, shard)
    }

    #[test]
    fn test_dryrun_caps_batch_count() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, mut shard) = tiny_runner(dir.path(), Some(3), false, 100);
        let summary = runner.run_epoch(0, &mut shard).unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(runner.step(), 3);
        assert!(summary.loss_avg.is_finite());
    }

    #[test]
    fn test_step_counter_is_monotonic_across_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, mut shard) = tiny_runner(dir.path(), Some(2), false, 100);
        runner.run_epoch(0, &mut shard).unwrap();
        assert_eq!(runner.step(), 2);
        runner.run_epoch(1, &mut shard).unwrap();
        // +1 per batch, no resets or gaps at the epoch boundary
        assert_eq!(runner.step(), 4);
    }

    #[test]
    fn test_temperature_is_clamped_after_steps() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, mut shard) = tiny_runner(dir.path(), Some(1), false, 100);

        let bound = 100f64.ln();
        for injected in [10.0f32, -10.0] {
            {
                let _guard = tch::no_grad_guard();
                let mut temperature = runner.model().temperature();
                let _ = temperature.copy_(&Tensor::from_slice(&[injected]));
            }
            runner.run_epoch(0, &mut shard).unwrap();
            let value = runner.model().temperature().double_value(&[0]);
            assert!(
                value >= -bound - 1e-6 && value <= bound + 1e-6,
                "temperature {value} escaped [{:.3}, {:.3}]",
                -bound,
                bound
            );
        }
    }

    #[test]
    fn test_coordinator_records_step_and_epoch_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, mut shard) = tiny_runner(dir.path(), Some(3), false, 2);
        runner.run_epoch(0, &mut shard).unwrap();

        let records = load_scalars(&dir.path().join("tb").join("scalars.jsonl")).unwrap();
        let count = |tag: &str| records.iter().filter(|r| r.tag == tag).count();
        assert_eq!(count("loss/step"), 3);
        assert_eq!(count("grad/l2_norm_sum"), 3);
        assert_eq!(count("temperature/step"), 3);
        assert_eq!(count("loss/epoch"), 1);
        assert_eq!(count("timings/epoch_s"), 1);
    }

    #[test]
    fn test_checkpoints_written_on_both_cadences() {
        let dir = tempfile::tempdir().unwrap();
        // steps 0,1,2 -> step 2 divides; epoch 0 divides interval 1
        let (mut runner, mut shard) = tiny_runner(dir.path(), Some(3), false, 2);
        runner.run_epoch(0, &mut shard).unwrap();

        let files: Vec<String> = std::fs::read_dir(dir.path().join("model"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.contains("step00000002")));
        assert!(files.iter().any(|f| f.contains("epoch000")));
    }

    #[test]
    fn test_profiler_trace_written_even_under_dryrun() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, mut shard) = tiny_runner(dir.path(), Some(2), true, 100);
        runner.run_epoch(0, &mut shard).unwrap();
        assert!(dir
            .path()
            .join("tb")
            .join("trace_epoch000_rank0.json")
            .exists());
    }
}
