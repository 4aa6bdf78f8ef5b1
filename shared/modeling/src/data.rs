//! Per-rank batch sources.
//!
//! The streaming pipeline proper lives outside this system; what the
//! trainer needs is an iterable of (image, token) batches whose length is
//! known before iteration starts, so the batch loop can be bounded
//! identically on every rank. The epoch selector is an environment
//! variable so an external dataset process can pick its shard epoch the
//! same way.

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tch::{Device, Kind, TchError, Tensor};
use thiserror::Error;
use tracing::debug;

use clasp_core::ModelDims;

/// Epoch selector consumed by the dataset side for shard reshuffling.
/// Written once per epoch by the worker, before iteration begins.
pub const DATA_EPOCH_ENV: &str = "CLASP_DATA_EPOCH";

#[derive(Debug, Error)]
pub enum DataError {
    #[error("data directory {0} holds no .safetensors batch files for this world size")]
    EmptyShard(PathBuf),

    #[error("batch file {path} is missing tensor '{name}'")]
    MissingTensor { path: PathBuf, name: String },

    #[error("{DATA_EPOCH_ENV} is not an integer: {0:?}")]
    BadEpoch(String),

    #[error("shard exhausted: batch {requested} of {available} requested")]
    Exhausted { requested: usize, available: usize },

    #[error(transparent)]
    Torch(#[from] TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One (image, text) batch pulled from a rank's shard.
#[derive(Debug)]
pub struct VisionTextBatch {
    pub images: Tensor,
    pub token_ids: Tensor,
    pub token_mask: Option<Tensor>,
}

impl VisionTextBatch {
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            images: self.images.to_device(device),
            token_ids: self.token_ids.to_device(device),
            token_mask: self.token_mask.as_ref().map(|m| m.to_device(device)),
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.images.size()[0]
    }
}

/// A rank's view of the training data.
pub trait BatchProvider {
    /// How many batches one epoch yields on this rank. Must agree across
    /// ranks: the trainer sizes its bounded batch loop with it, and a
    /// divergent count deadlocks the collective group.
    fn batches_per_epoch(&self) -> usize;

    /// Reposition the shard for `epoch`. When `CLASP_DATA_EPOCH` is set it
    /// takes precedence over the passed index.
    fn begin_epoch(&mut self, epoch: usize) -> Result<(), DataError>;

    fn next_batch(&mut self) -> Result<VisionTextBatch, DataError>;
}

fn epoch_from_env(fallback: usize) -> Result<usize, DataError> {
    match std::env::var(DATA_EPOCH_ENV) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| DataError::BadEpoch(raw)),
        Err(_) => Ok(fallback),
    }
}

/// Deterministic random batches, seeded per (rank, epoch).
///
/// Stands in for the external streaming pipeline; shapes and dtypes match
/// what that pipeline delivers.
#[derive(Debug)]
pub struct SyntheticShard {
    dims: ModelDims,
    batch_size: i64,
    vocab_size: i64,
    batches: usize,
    rank: usize,
    cursor: usize,
    rng: StdRng,
}

impl SyntheticShard {
    pub fn new(
        dims: &ModelDims,
        batch_size: i64,
        vocab_size: i64,
        batches_per_epoch: usize,
        rank: usize,
    ) -> Self {
        Self {
            dims: *dims,
            batch_size,
            vocab_size,
            batches: batches_per_epoch,
            rank,
            cursor: 0,
            rng: StdRng::seed_from_u64(rank as u64),
        }
    }
}

impl BatchProvider for SyntheticShard {
    fn batches_per_epoch(&self) -> usize {
        self.batches
    }

    fn begin_epoch(&mut self, epoch: usize) -> Result<(), DataError> {
        let epoch = epoch_from_env(epoch)?;
        let seed = (epoch as u64)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(self.rank as u64);
        self.rng = StdRng::seed_from_u64(seed);
        self.cursor = 0;
        debug!(rank = self.rank, epoch, seed, "synthetic shard reseeded");
        Ok(())
    }

    fn next_batch(&mut self) -> Result<VisionTextBatch, DataError> {
        if self.cursor >= self.batches {
            return Err(DataError::Exhausted {
                requested: self.cursor + 1,
                available: self.batches,
            });
        }
        self.cursor += 1;

        let pixels = (self.batch_size
            * self.dims.channels
            * self.dims.visual_image_size
            * self.dims.visual_image_size) as usize;
        let image_values: Vec<f32> = (0..pixels).map(|_| self.rng.gen_range(-1.0..1.0)).collect();
        let images = Tensor::from_slice(&image_values).reshape([
            self.batch_size,
            self.dims.channels,
            self.dims.visual_image_size,
            self.dims.visual_image_size,
        ]);

        let token_count = (self.batch_size * self.dims.text_seq_len) as usize;
        let token_values: Vec<i64> = (0..token_count)
            .map(|_| self.rng.gen_range(0..self.vocab_size))
            .collect();
        let token_ids = Tensor::from_slice(&token_values)
            .reshape([self.batch_size, self.dims.text_seq_len]);

        let token_mask = Tensor::ones(
            [self.batch_size, self.dims.text_seq_len],
            (Kind::Bool, Device::Cpu),
        );

        Ok(VisionTextBatch {
            images,
            token_ids,
            token_mask: Some(token_mask),
        })
    }
}

/// Pre-batched safetensors files, one batch per file, dealt round-robin
/// across ranks after an epoch-seeded shuffle that every rank computes
/// identically.
#[derive(Debug)]
pub struct SafetensorsShard {
    files: Vec<PathBuf>,
    rank: usize,
    world_size: usize,
    order: Vec<usize>,
    cursor: usize,
}

impl SafetensorsShard {
    pub fn from_dir(dir: &Path, rank: usize, world_size: usize) -> Result<Self, DataError> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        files.sort();
        if files.len() < world_size {
            return Err(DataError::EmptyShard(dir.to_path_buf()));
        }
        let mut shard = Self {
            files,
            rank,
            world_size,
            order: Vec::new(),
            cursor: 0,
        };
        shard.begin_epoch(0)?;
        Ok(shard)
    }

    fn load_batch(&self, path: &Path) -> Result<VisionTextBatch, DataError> {
        let tensors = Tensor::read_safetensors(path)?;
        let find = |name: &str| {
            tensors
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, t)| t.shallow_clone())
        };
        let images = find("images").ok_or_else(|| DataError::MissingTensor {
            path: path.to_path_buf(),
            name: "images".into(),
        })?;
        let token_ids = find("token_ids").ok_or_else(|| DataError::MissingTensor {
            path: path.to_path_buf(),
            name: "token_ids".into(),
        })?;
        Ok(VisionTextBatch {
            images,
            token_ids,
            token_mask: find("token_mask"),
        })
    }
}

impl BatchProvider for SafetensorsShard {
    fn batches_per_epoch(&self) -> usize {
        // floor division keeps the count identical on every rank
        self.files.len() / self.world_size
    }

    fn begin_epoch(&mut self, epoch: usize) -> Result<(), DataError> {
        let epoch = epoch_from_env(epoch)?;
        // same permutation on every rank, then a rank-strided slice of it
        let mut indices: Vec<usize> = (0..self.files.len()).collect();
        indices.shuffle(&mut StdRng::seed_from_u64(epoch as u64));
        self.order = indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .take(self.batches_per_epoch())
            .collect();
        self.cursor = 0;
        debug!(
            rank = self.rank,
            epoch,
            batches = self.order.len(),
            "safetensors shard reshuffled"
        );
        Ok(())
    }

    fn next_batch(&mut self) -> Result<VisionTextBatch, DataError> {
        let Some(&index) = self.order.get(self.cursor) else {
            return Err(DataError::Exhausted {
                requested: self.cursor + 1,
                available: self.order.len(),
            });
        };
        self.cursor += 1;
        self.load_batch(&self.files[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn batch_sum(batch: &VisionTextBatch) -> f64 {
        batch.images.sum(Kind::Float).double_value(&[])
    }

    #[test]
    fn test_synthetic_shapes() {
        let dims = tiny_dims();
        let mut shard = SyntheticShard::new(&dims, 4, 64, 2, 0);
        shard.begin_epoch(0).unwrap();
        let batch = shard.next_batch().unwrap();
        assert_eq!(batch.images.size(), vec![4, 3, 16, 16]);
        assert_eq!(batch.token_ids.size(), vec![4, 8]);
        assert_eq!(batch.token_mask.as_ref().unwrap().size(), vec![4, 8]);
        assert_eq!(batch.batch_size(), 4);
    }

    #[test]
    fn test_synthetic_is_deterministic_per_rank_and_epoch() {
        let dims = tiny_dims();
        let mut a = SyntheticShard::new(&dims, 2, 64, 1, 1);
        let mut b = SyntheticShard::new(&dims, 2, 64, 1, 1);
        a.begin_epoch(3).unwrap();
        b.begin_epoch(3).unwrap();
        let epoch3 = batch_sum(&a.next_batch().unwrap());
        assert_eq!(epoch3, batch_sum(&b.next_batch().unwrap()));

        let mut c = SyntheticShard::new(&dims, 2, 64, 1, 1);
        c.begin_epoch(4).unwrap();
        assert_ne!(epoch3, batch_sum(&c.next_batch().unwrap()));

        let mut other_rank = SyntheticShard::new(&dims, 2, 64, 1, 0);
        other_rank.begin_epoch(3).unwrap();
        assert_ne!(epoch3, batch_sum(&other_rank.next_batch().unwrap()));
    }

    #[test]
    fn test_synthetic_exhausts_after_declared_length() {
        let dims = tiny_dims();
        let mut shard = SyntheticShard::new(&dims, 2, 64, 2, 0);
        shard.begin_epoch(0).unwrap();
        assert!(shard.next_batch().is_ok());
        assert!(shard.next_batch().is_ok());
        assert!(matches!(
            shard.next_batch(),
            Err(DataError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_safetensors_shard_round_robin() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            let images = Tensor::full(
                [2, 3, 16, 16],
                i as f64,
                (Kind::Float, Device::Cpu),
            );
            let token_ids = Tensor::zeros([2, 8], (Kind::Int64, Device::Cpu));
            let named = [("images", images), ("token_ids", token_ids)];
            Tensor::write_safetensors(&named, dir.path().join(format!("batch{i}.safetensors")))
                .unwrap();
        }

        let mut rank0 = SafetensorsShard::from_dir(dir.path(), 0, 2).unwrap();
        let mut rank1 = SafetensorsShard::from_dir(dir.path(), 1, 2).unwrap();
        assert_eq!(rank0.batches_per_epoch(), 2);
        assert_eq!(rank1.batches_per_epoch(), 2);

        let mut seen = Vec::new();
        for shard in [&mut rank0, &mut rank1] {
            shard.begin_epoch(0).unwrap();
            for _ in 0..2 {
                seen.push(batch_sum(&shard.next_batch().unwrap()));
            }
        }
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        // all four files seen exactly once across the two ranks
        let expected: Vec<f64> = (0..4).map(|i| (i * 2 * 3 * 16 * 16) as f64).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_safetensors_shard_rejects_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SafetensorsShard::from_dir(dir.path(), 0, 2),
            Err(DataError::EmptyShard(_))
        ));
    }
}
