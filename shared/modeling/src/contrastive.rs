use tch::{Device, Tensor};

/// Per-call behavior switches for the forward pass.
#[derive(Debug, Clone, Copy)]
pub struct ForwardFlags {
    /// Compute the contrastive loss (training path). When false only the
    /// similarity matrix is produced.
    pub return_loss: bool,
    /// Run the image tower without recording gradients.
    pub freeze_image_encoder: bool,
    /// Which similarity direction to return when not computing a loss.
    pub text_to_image: bool,
}

impl Default for ForwardFlags {
    fn default() -> Self {
        Self {
            return_loss: true,
            freeze_image_encoder: false,
            text_to_image: true,
        }
    }
}

/// The dual-encoder contract the trainer drives.
///
/// The trainer treats the model as opaque: it forwards batches, reads the
/// scalar loss, iterates variables for gradient sync / clipping /
/// checkpoints, and clamps the learned temperature after each optimizer
/// step. Variables must come back in a stable name-sorted order.
pub trait ContrastiveModel {
    /// Returns `(similarity, loss)`. The loss is present iff
    /// `flags.return_loss`; the similarity direction follows
    /// `flags.text_to_image`.
    fn forward(
        &self,
        text_ids: &Tensor,
        images: &Tensor,
        text_mask: Option<&Tensor>,
        flags: ForwardFlags,
    ) -> (Option<Tensor>, Option<Tensor>);

    fn device(&self) -> Device;

    /// Named parameters in stable name-sorted order.
    fn variables(&self) -> Vec<(String, Tensor)>;

    /// The learned temperature scaling the contrastive logits.
    fn temperature(&self) -> Tensor;
}
