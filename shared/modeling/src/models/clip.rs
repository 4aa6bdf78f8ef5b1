use std::sync::Arc;

use tch::nn::{self, Module};
use tch::{Device, Kind, TchError, Tensor};
use thiserror::Error;

use clasp_core::{ModelDims, ModelFlags};

use crate::contrastive::{ContrastiveModel, ForwardFlags};
use crate::parallelism::Communicator;
use crate::variables::stable_variables;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("visual image size {image_size} is not divisible by patch size {patch_size}")]
    PatchSize { image_size: i64, patch_size: i64 },

    #[error("downsampling needs an even patch grid, got {0}x{0}")]
    DownsampleGrid(i64),

    #[error("model needs {needed} visual position embeddings but only {available} are configured")]
    VisualTokens { needed: i64, available: i64 },

    #[error("encoder dim {dim} is not divisible by head count {heads}")]
    HeadDim { dim: i64, heads: i64 },
}

/// Pre-LN transformer block shared by both towers.
#[derive(Debug)]
struct EncoderBlock {
    norm1: nn::LayerNorm,
    qkv: nn::Linear,
    proj: nn::Linear,
    norm2: nn::LayerNorm,
    fc1: nn::Linear,
    fc2: nn::Linear,
    heads: i64,
}

impl EncoderBlock {
    fn new(p: &nn::Path, dim: i64, heads: i64) -> Self {
        Self {
            norm1: nn::layer_norm(p / "norm1", vec![dim], Default::default()),
            qkv: nn::linear(p / "qkv", dim, 3 * dim, Default::default()),
            proj: nn::linear(p / "proj", dim, dim, Default::default()),
            norm2: nn::layer_norm(p / "norm2", vec![dim], Default::default()),
            fc1: nn::linear(p / "fc1", dim, 4 * dim, Default::default()),
            fc2: nn::linear(p / "fc2", 4 * dim, dim, Default::default()),
            heads,
        }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        let size = x.size();
        let (b, t, d) = (size[0], size[1], size[2]);
        let head_dim = d / self.heads;

        let qkv = x
            .apply(&self.norm1)
            .apply(&self.qkv)
            .reshape([b, t, 3, self.heads, head_dim])
            .permute([2, 0, 3, 1, 4]);
        let (q, k, v) = (qkv.get(0), qkv.get(1), qkv.get(2));

        let attn = (q.matmul(&k.transpose(-2, -1)) / (head_dim as f64).sqrt())
            .softmax(-1, Kind::Float);
        let out = attn
            .matmul(&v)
            .transpose(1, 2)
            .reshape([b, t, d])
            .apply(&self.proj);

        let x = x + out;
        let mlp = x
            .apply(&self.norm2)
            .apply(&self.fc1)
            .gelu("none")
            .apply(&self.fc2);
        x + mlp
    }
}

/// Dual-encoder contrastive vision-language model.
///
/// A text tower and an image tower project into a shared latent space; the
/// loss is a symmetric InfoNCE over the batch with a learned temperature.
/// Structural variants (`ModelFlags`) are fixed at construction; per-call
/// behavior comes in through [`ForwardFlags`].
#[derive(Debug)]
pub struct Clip {
    vs: nn::VarStore,

    token_embedding: nn::Embedding,
    text_pos_embedding: Tensor,
    text_blocks: Vec<EncoderBlock>,
    text_norm: nn::LayerNorm,
    to_text_latent: nn::Linear,
    to_text_latent_extra: Option<nn::Linear>,

    patch_embedding: nn::Conv2D,
    visual_pos_embedding: Tensor,
    visual_blocks: Vec<EncoderBlock>,
    visual_norm: nn::LayerNorm,
    to_visual_latent: nn::Linear,
    to_visual_latent_extra: Option<nn::Linear>,

    temperature: Tensor,

    flags: ModelFlags,
    device: Device,
    comm: Option<Arc<Communicator>>,
}

impl Clip {
    pub fn new(
        device: Device,
        dims: &ModelDims,
        flags: &ModelFlags,
        num_text_tokens: i64,
        comm: Option<Arc<Communicator>>,
    ) -> Result<Self, ModelError> {
        if dims.visual_image_size % dims.visual_patch_size != 0 {
            return Err(ModelError::PatchSize {
                image_size: dims.visual_image_size,
                patch_size: dims.visual_patch_size,
            });
        }
        let mut grid = dims.visual_image_size / dims.visual_patch_size;
        if flags.downsample_image_embeds {
            if grid % 2 != 0 {
                return Err(ModelError::DownsampleGrid(grid));
            }
            grid /= 2;
        }
        let visual_tokens = grid * grid;
        if visual_tokens > dims.num_visual_tokens {
            return Err(ModelError::VisualTokens {
                needed: visual_tokens,
                available: dims.num_visual_tokens,
            });
        }
        if dims.dim_text % dims.text_heads != 0 {
            return Err(ModelError::HeadDim {
                dim: dims.dim_text,
                heads: dims.text_heads,
            });
        }
        if dims.dim_image % dims.visual_heads != 0 {
            return Err(ModelError::HeadDim {
                dim: dims.dim_image,
                heads: dims.visual_heads,
            });
        }

        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let token_embedding = nn::embedding(
            &root / "token_embedding",
            num_text_tokens,
            dims.dim_text,
            Default::default(),
        );
        let text_pos_embedding = root.var(
            "text_pos_embedding",
            &[dims.text_seq_len, dims.dim_text],
            nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        );
        let text_blocks_root = &root / "text_blocks";
        let text_blocks = (0..dims.text_enc_depth)
            .map(|i| EncoderBlock::new(&(&text_blocks_root / i), dims.dim_text, dims.text_heads))
            .collect();
        let text_norm = nn::layer_norm(&root / "text_norm", vec![dims.dim_text], Default::default());
        let latent_config = nn::LinearConfig {
            bias: false,
            ..Default::default()
        };
        let to_text_latent = nn::linear(
            &root / "to_text_latent",
            dims.dim_text,
            dims.dim_latent,
            latent_config,
        );

        let patch_embedding = nn::conv2d(
            &root / "patch_embedding",
            dims.channels,
            dims.dim_image,
            dims.visual_patch_size,
            nn::ConvConfig {
                stride: dims.visual_patch_size,
                ..Default::default()
            },
        );
        let visual_pos_embedding = root.var(
            "visual_pos_embedding",
            &[dims.num_visual_tokens, dims.dim_image],
            nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        );
        let visual_blocks_root = &root / "visual_blocks";
        let visual_blocks = (0..dims.visual_enc_depth)
            .map(|i| {
                EncoderBlock::new(
                    &(&visual_blocks_root / i),
                    dims.dim_image,
                    dims.visual_heads,
                )
            })
            .collect();
        let visual_norm = nn::layer_norm(
            &root / "visual_norm",
            vec![dims.dim_image],
            Default::default(),
        );
        let to_visual_latent = nn::linear(
            &root / "to_visual_latent",
            dims.dim_image,
            dims.dim_latent,
            latent_config,
        );

        let (to_text_latent_extra, to_visual_latent_extra) = if flags.extra_latent_projection {
            (
                Some(nn::linear(
                    &root / "to_text_latent_extra",
                    dims.dim_text,
                    dims.dim_latent,
                    latent_config,
                )),
                Some(nn::linear(
                    &root / "to_visual_latent_extra",
                    dims.dim_image,
                    dims.dim_latent,
                    latent_config,
                )),
            )
        } else {
            (None, None)
        };

        let temperature = root.var("temperature", &[1], nn::Init::Const(1.0));

        Ok(Self {
            vs,
            token_embedding,
            text_pos_embedding,
            text_blocks,
            text_norm,
            to_text_latent,
            to_text_latent_extra,
            patch_embedding,
            visual_pos_embedding,
            visual_blocks,
            visual_norm,
            to_visual_latent,
            to_visual_latent_extra,
            temperature,
            flags: *flags,
            device,
            comm,
        })
    }

    /// Restore a full-parameter snapshot written by the checkpointer.
    pub fn load_weights<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<(), TchError> {
        self.vs.load(path)
    }

    fn encode_text(&self, text_ids: &Tensor) -> Tensor {
        let seq = text_ids.size()[1];
        let mut x = text_ids.apply(&self.token_embedding)
            + self.text_pos_embedding.narrow(0, 0, seq).unsqueeze(0);
        for block in &self.text_blocks {
            x = block.forward(&x);
        }
        x.apply(&self.text_norm)
    }

    fn encode_image(&self, images: &Tensor) -> Tensor {
        let mut grid = images.apply(&self.patch_embedding);
        if self.flags.downsample_image_embeds {
            let size = grid.size();
            grid = grid.adaptive_avg_pool2d([size[2] / 2, size[3] / 2]);
        }
        let tokens = grid.flatten(2, 3).transpose(1, 2);
        let n = tokens.size()[1];
        let mut x = tokens + self.visual_pos_embedding.narrow(0, 0, n).unsqueeze(0);
        for block in &self.visual_blocks {
            x = block.forward(&x);
        }
        x.apply(&self.visual_norm)
    }

    /// Similarity between every query row and every candidate row.
    ///
    /// Pooled latents: a plain `[x, y]` dot-product matrix. All-token
    /// latents: fine-grained token matching, max over candidate tokens then
    /// (mask-weighted) mean over query tokens.
    fn pairwise_similarity(
        &self,
        query: &Tensor,
        candidates: &Tensor,
        query_mask: Option<&Tensor>,
    ) -> Tensor {
        if !self.flags.use_all_token_embeds {
            return query.matmul(&candidates.transpose(0, 1));
        }
        let sims = query
            .unsqueeze(1)
            .matmul(&candidates.unsqueeze(0).transpose(2, 3));
        let (best, _) = sims.max_dim(3, false);
        match query_mask {
            Some(mask) => {
                let mask = mask.to_kind(Kind::Float).unsqueeze(1);
                (best * &mask).sum_dim_intlist(&[2i64][..], false, Kind::Float)
                    / mask
                        .sum_dim_intlist(&[2i64][..], false, Kind::Float)
                        .clamp_min(1e-6)
            }
            None => best.mean_dim(&[2i64][..], false, Kind::Float),
        }
    }

    /// Concatenate this latent across all ranks, rank-ordered, keeping the
    /// local block attached to the autograd graph. Remote blocks carry no
    /// gradient, matching the usual cross-rank contrastive setup.
    fn gather_across_ranks(&self, local: &Tensor) -> Tensor {
        let Some(comm) = &self.comm else {
            return local.shallow_clone();
        };
        let world = comm.world_size() as i64;
        if world == 1 {
            return local.shallow_clone();
        }
        let rank = comm.rank() as i64;
        let size = local.size();
        let rows = size[0];
        let flat = local
            .detach()
            .to_kind(Kind::Float)
            .flatten(0, -1)
            .to_device(Device::Cpu);
        let values = Vec::<f32>::try_from(&flat).expect("latents to host buffer");
        let gathered = comm
            .all_gather(&values)
            .expect("all-gather of latents across ranks");
        let mut full_size = size.clone();
        full_size[0] = rows * world;
        let full = Tensor::from_slice(&gathered)
            .reshape(full_size.as_slice())
            .to_kind(local.kind())
            .to_device(local.device());
        let before = full.narrow(0, 0, rank * rows);
        let after = full.narrow(0, (rank + 1) * rows, (world - rank - 1) * rows);
        Tensor::cat(&[&before, local, &after], 0)
    }

    fn contrastive_loss(&self, sim: &Tensor, labels: &Tensor) -> Tensor {
        if !self.flags.decoupled_contrastive_learning {
            return sim.cross_entropy_for_logits(labels);
        }
        // DCL: the positive pair is removed from the denominator.
        let positive = sim
            .gather(1, &labels.unsqueeze(1), false)
            .squeeze_dim(1);
        let positive_mask = Tensor::zeros_like(sim)
            .scatter_value(1, &labels.unsqueeze(1), 1.0)
            .to_kind(Kind::Bool);
        let denominator = sim
            .masked_fill(&positive_mask, f64::NEG_INFINITY)
            .logsumexp(1, false);
        (denominator - positive).mean(Kind::Float)
    }
}

fn l2norm(t: &Tensor) -> Tensor {
    t / t.norm_scalaropt_dim(2, [-1], true)
}

fn pooled(tokens: &Tensor, mask: Option<&Tensor>) -> Tensor {
    match mask {
        Some(mask) => {
            let mask = mask.to_kind(Kind::Float).unsqueeze(-1);
            (tokens * &mask).sum_dim_intlist(&[1i64][..], false, Kind::Float)
                / mask
                    .sum_dim_intlist(&[1i64][..], false, Kind::Float)
                    .clamp_min(1e-6)
        }
        None => tokens.mean_dim(&[1i64][..], false, Kind::Float),
    }
}

impl ContrastiveModel for Clip {
    fn forward(
        &self,
        text_ids: &Tensor,
        images: &Tensor,
        text_mask: Option<&Tensor>,
        flags: ForwardFlags,
    ) -> (Option<Tensor>, Option<Tensor>) {
        let batch = text_ids.size()[0];

        let text_tokens = self.encode_text(text_ids);
        let image_tokens = if flags.freeze_image_encoder {
            tch::no_grad(|| self.encode_image(images))
        } else {
            self.encode_image(images)
        };

        let (text_base, image_base) = if self.flags.use_all_token_embeds {
            (text_tokens, image_tokens)
        } else {
            (
                pooled(&text_tokens, text_mask),
                pooled(&image_tokens, None),
            )
        };

        let text_latents = l2norm(&text_base.apply(&self.to_text_latent));
        let image_latents = l2norm(&image_base.apply(&self.to_visual_latent));
        // image->text direction optionally gets its own projections
        let (text_latents_rev, image_latents_rev) =
            match (&self.to_text_latent_extra, &self.to_visual_latent_extra) {
                (Some(text_extra), Some(visual_extra)) => (
                    l2norm(&text_base.apply(text_extra)),
                    l2norm(&image_base.apply(visual_extra)),
                ),
                _ => (text_latents.shallow_clone(), image_latents.shallow_clone()),
            };

        let temperature = self.temperature.exp();

        if !flags.return_loss {
            let sim = if flags.text_to_image {
                self.pairwise_similarity(&text_latents, &image_latents, text_mask)
            } else {
                self.pairwise_similarity(&image_latents_rev, &text_latents_rev, None)
            } * &temperature;
            return (Some(sim), None);
        }

        let (candidate_images, candidate_texts, offset) = if self.flags.loss_over_ranks {
            let offset = match &self.comm {
                Some(comm) => comm.rank() as i64 * batch,
                None => 0,
            };
            (
                self.gather_across_ranks(&image_latents),
                self.gather_across_ranks(&text_latents_rev),
                offset,
            )
        } else {
            (
                image_latents.shallow_clone(),
                text_latents_rev.shallow_clone(),
                0,
            )
        };

        let sim_text = self.pairwise_similarity(&text_latents, &candidate_images, text_mask)
            * &temperature;
        let sim_image =
            self.pairwise_similarity(&image_latents_rev, &candidate_texts, None) * &temperature;

        let labels = Tensor::arange(batch, (Kind::Int64, self.device)) + offset;
        let loss = (self.contrastive_loss(&sim_text, &labels)
            + self.contrastive_loss(&sim_image, &labels))
            / 2.0;

        let sim = if flags.text_to_image {
            sim_text
        } else {
            sim_image
        };
        (Some(sim), Some(loss))
    }

    fn device(&self) -> Device {
        self.device
    }

    fn variables(&self) -> Vec<(String, Tensor)> {
        stable_variables(&self.vs)
    }

    fn temperature(&self) -> Tensor {
        self.temperature.shallow_clone()
    }
}
