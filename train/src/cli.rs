use std::path::PathBuf;

use clap::{ArgAction, Parser};

use clasp_core::{ModelDims, ModelFlags, RunConfig};
use clasp_modeling::Devices;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "clasp-train",
    about = "Single-node multi-device data-parallel training for a dual-encoder contrastive vision-language model"
)]
pub struct Args {
    /// Run id; names the result directory for this invocation.
    #[arg(long)]
    pub id: String,

    /// Root of the results tree (logs, metric streams, model weights).
    #[arg(long, default_value = "results")]
    pub path_results: PathBuf,

    /// Directory of pre-batched training data; synthetic batches stand in
    /// when omitted.
    #[arg(long)]
    pub path_data_train: Option<PathBuf>,

    /// Validation data path. Reserved: the validation pass is stubbed.
    #[arg(long)]
    pub path_data_valid: Option<PathBuf>,

    /// Prior weights to reload before training.
    #[arg(long)]
    pub path_weights: Option<PathBuf>,

    /// Dataloader worker count, forwarded to the data provider.
    #[arg(long, default_value_t = 0)]
    pub num_workers: usize,

    /// Learning rate.
    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,

    /// Per-rank batch size.
    #[arg(long, default_value_t = 128)]
    pub bs: i64,

    /// Epochs to train.
    #[arg(long, default_value_t = 2)]
    pub epochs: usize,

    /// Process only this many batches per epoch, to validate the setup.
    #[arg(long)]
    pub dryrun: Option<usize>,

    #[arg(long, default_value_t = 512)]
    pub dim_text: i64,

    #[arg(long, default_value_t = 512)]
    pub dim_image: i64,

    #[arg(long, default_value_t = 512)]
    pub dim_latent: i64,

    #[arg(long, default_value_t = 512)]
    pub num_visual_tokens: i64,

    #[arg(long, default_value_t = 6)]
    pub text_enc_depth: i64,

    #[arg(long, default_value_t = 256)]
    pub text_seq_len: i64,

    #[arg(long, default_value_t = 8)]
    pub text_heads: i64,

    #[arg(long, default_value_t = 6)]
    pub visual_enc_depth: i64,

    #[arg(long, default_value_t = 8)]
    pub visual_heads: i64,

    #[arg(long, default_value_t = 256)]
    pub visual_image_size: i64,

    #[arg(long, default_value_t = 32)]
    pub visual_patch_size: i64,

    #[arg(long, default_value_t = 3)]
    pub channels: i64,

    /// Score with every token embedding instead of pooled latents.
    #[arg(long)]
    pub use_all_token_embeds: bool,

    /// Halve the patch grid before the visual encoder.
    #[arg(long)]
    pub downsample_image_embeds: bool,

    /// Drop the positive pair from the contrastive denominator.
    #[arg(long)]
    pub decoupled_contrastive_learning: bool,

    /// Separate latent projections for the image-to-text direction.
    #[arg(long)]
    pub extra_latent_projection: bool,

    /// Run the image tower without gradients.
    #[arg(long)]
    pub freeze_image_encoder: bool,

    /// Similarity direction reported by non-loss forwards.
    #[arg(
        long,
        action = ArgAction::Set,
        default_value_t = true,
        default_missing_value = "true",
        num_args = 0..=1,
        require_equals = false
    )]
    pub text_to_image: bool,

    /// Contrast against latents gathered from every rank, not just local.
    #[arg(long)]
    pub loss_over_ranks: bool,

    /// Clip the global gradient norm to this value before each step.
    #[arg(long)]
    pub clip_grad_norm: Option<f64>,

    /// Save a checkpoint every N epochs.
    #[arg(long, default_value_t = 1)]
    pub save_interval_epoch: usize,

    /// Save a checkpoint every N steps.
    #[arg(long, default_value_t = 4_000)]
    pub save_interval_step: usize,

    /// Record profiler traces over a bounded schedule.
    #[arg(long)]
    pub tb_profiler: bool,

    /// Device(s) to use: auto, cpu, mps, cuda, cuda:X,Y,Z
    #[arg(long, default_value = "auto")]
    pub device: Devices,

    /// Worker count override; defaults to the detected device count.
    #[arg(long)]
    pub workers: Option<usize>,
}

impl Args {
    /// The immutable per-process run configuration. Built once, never
    /// mutated after spawn.
    pub fn to_run_config(&self) -> RunConfig {
        RunConfig {
            run_id: self.id.clone(),
            path_results: self.path_results.clone(),
            path_data_train: self.path_data_train.clone(),
            path_data_valid: self.path_data_valid.clone(),
            path_weights: self.path_weights.clone(),
            data_workers: self.num_workers,
            lr: self.lr,
            batch_size: self.bs,
            epochs: self.epochs,
            dryrun: self.dryrun,
            model: ModelDims {
                dim_text: self.dim_text,
                dim_image: self.dim_image,
                dim_latent: self.dim_latent,
                num_visual_tokens: self.num_visual_tokens,
                text_enc_depth: self.text_enc_depth,
                text_seq_len: self.text_seq_len,
                text_heads: self.text_heads,
                visual_enc_depth: self.visual_enc_depth,
                visual_heads: self.visual_heads,
                visual_image_size: self.visual_image_size,
                visual_patch_size: self.visual_patch_size,
                channels: self.channels,
            },
            flags: ModelFlags {
                use_all_token_embeds: self.use_all_token_embeds,
                downsample_image_embeds: self.downsample_image_embeds,
                decoupled_contrastive_learning: self.decoupled_contrastive_learning,
                extra_latent_projection: self.extra_latent_projection,
                loss_over_ranks: self.loss_over_ranks,
            },
            freeze_image_encoder: self.freeze_image_encoder,
            text_to_image: self.text_to_image,
            clip_grad_norm: self.clip_grad_norm,
            save_interval_epoch: self.save_interval_epoch,
            save_interval_step: self.save_interval_step,
            tb_profiler: self.tb_profiler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let args = Args::parse_from(["clasp-train", "--id", "t"]);
        assert_eq!(args.lr, 1e-4);
        assert_eq!(args.bs, 128);
        assert_eq!(args.epochs, 2);
        assert_eq!(args.save_interval_step, 4_000);
        assert!(args.text_to_image);
        assert!(!args.use_all_token_embeds);
        assert!(args.dryrun.is_none());
        assert!(args.clip_grad_norm.is_none());
    }

    #[test]
    fn test_text_to_image_can_be_disabled_explicitly() {
        let args = Args::parse_from(["clasp-train", "--id", "t", "--text-to-image", "false"]);
        assert!(!args.text_to_image);
    }

    #[test]
    fn test_run_config_mirrors_args() {
        let args = Args::parse_from([
            "clasp-train",
            "--id",
            "run-1",
            "--dryrun",
            "3",
            "--clip-grad-norm",
            "1.5",
            "--loss-over-ranks",
        ]);
        let config = args.to_run_config();
        assert_eq!(config.run_id, "run-1");
        assert_eq!(config.dryrun, Some(3));
        assert_eq!(config.clip_grad_norm, Some(1.5));
        assert!(config.flags.loss_over_ranks);
        assert_eq!(config.model.dim_text, 512);
    }
}
