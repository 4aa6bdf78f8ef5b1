use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Role;

/// A worker's identity within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerId {
    pub rank: usize,
    pub world_size: usize,
}

impl WorkerId {
    pub fn role(&self) -> Role {
        Role::from_rank(self.rank)
    }
}

/// Encoder and projection dimensions of the dual-encoder model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDims {
    pub dim_text: i64,
    pub dim_image: i64,
    pub dim_latent: i64,
    pub num_visual_tokens: i64,
    pub text_enc_depth: i64,
    pub text_seq_len: i64,
    pub text_heads: i64,
    pub visual_enc_depth: i64,
    pub visual_heads: i64,
    pub visual_image_size: i64,
    pub visual_patch_size: i64,
    pub channels: i64,
}

impl Default for ModelDims {
    fn default() -> Self {
        Self {
            dim_text: 512,
            dim_image: 512,
            dim_latent: 512,
            num_visual_tokens: 512,
            text_enc_depth: 6,
            text_seq_len: 256,
            text_heads: 8,
            visual_enc_depth: 6,
            visual_heads: 8,
            visual_image_size: 256,
            visual_patch_size: 32,
            channels: 3,
        }
    }
}

/// Structural feature toggles of the contrastive loss and latent heads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFlags {
    pub use_all_token_embeds: bool,
    pub downsample_image_embeds: bool,
    pub decoupled_contrastive_learning: bool,
    pub extra_latent_projection: bool,
    pub loss_over_ranks: bool,
}

/// One training invocation, immutable once constructed.
///
/// Built exactly once per process from the CLI and passed explicitly
/// through every component; nothing mutates it after spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_id: String,
    pub path_results: PathBuf,
    pub path_data_train: Option<PathBuf>,
    pub path_data_valid: Option<PathBuf>,
    pub path_weights: Option<PathBuf>,
    pub data_workers: usize,
    pub lr: f64,
    pub batch_size: i64,
    pub epochs: usize,
    pub dryrun: Option<usize>,
    pub model: ModelDims,
    pub flags: ModelFlags,
    pub freeze_image_encoder: bool,
    pub text_to_image: bool,
    pub clip_grad_norm: Option<f64>,
    pub save_interval_epoch: usize,
    pub save_interval_step: usize,
    pub tb_profiler: bool,
}

/// Filesystem layout of one run: `<results>/<run-id>/{.., tb/, model/}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub tb_dir: PathBuf,
    pub model_dir: PathBuf,
}

impl RunPaths {
    pub fn new(path_results: &Path, run_id: &str) -> Self {
        let run_dir = path_results.join(run_id);
        let tb_dir = run_dir.join("tb");
        let model_dir = run_dir.join("model");
        Self {
            run_dir,
            tb_dir,
            model_dir,
        }
    }

    pub fn create_all(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.run_dir)?;
        std::fs::create_dir_all(&self.tb_dir)?;
        std::fs::create_dir_all(&self.model_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_paths_layout() {
        let paths = RunPaths::new(Path::new("results"), "run-7");
        assert_eq!(paths.run_dir, PathBuf::from("results/run-7"));
        assert_eq!(paths.tb_dir, PathBuf::from("results/run-7/tb"));
        assert_eq!(paths.model_dir, PathBuf::from("results/run-7/model"));
    }

    #[test]
    fn test_worker_role() {
        let w = WorkerId {
            rank: 0,
            world_size: 4,
        };
        assert!(w.role().is_coordinator());
        let w = WorkerId {
            rank: 3,
            world_size: 4,
        };
        assert!(!w.role().is_coordinator());
    }
}
