use std::path::{Path, PathBuf};

use tch::{Device, TchError, Tensor};
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;

/// What a snapshot marks: a step boundary or an epoch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTag {
    Step(u64),
    Epoch(usize),
}

impl std::fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointTag::Step(step) => write!(f, "step{step:08}"),
            CheckpointTag::Epoch(epoch) => write!(f, "epoch{epoch:03}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to serialize checkpoint: {0}")]
    Torch(#[from] TchError),

    #[error("failed to format checkpoint timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Coordinator-only parameter snapshots.
///
/// Filenames encode a timestamp plus the zero-padded step or epoch, so no
/// path is ever reused within a run and earlier checkpoints are never
/// touched. Writes are fire-and-forget: no retry, no atomic rename; an I/O
/// error propagates and fails the run. Nothing is ever pruned.
#[derive(Debug)]
pub struct Checkpointer {
    model_dir: PathBuf,
    save_interval_step: usize,
    save_interval_epoch: usize,
}

impl Checkpointer {
    pub fn new(model_dir: &Path, save_interval_step: usize, save_interval_epoch: usize) -> Self {
        Self {
            model_dir: model_dir.to_path_buf(),
            save_interval_step: save_interval_step.max(1),
            save_interval_epoch: save_interval_epoch.max(1),
        }
    }

    /// Step-interval trigger; step 0 never saves.
    pub fn should_save_step(&self, step: u64) -> bool {
        step != 0 && step % self.save_interval_step as u64 == 0
    }

    pub fn should_save_epoch(&self, epoch: usize) -> bool {
        epoch % self.save_interval_epoch == 0
    }

    /// Serialize the replica's parameters to a fresh safetensors file and
    /// return its path.
    pub fn save(
        &self,
        vars: &[(String, Tensor)],
        tag: CheckpointTag,
    ) -> Result<PathBuf, CheckpointError> {
        let path = self
            .model_dir
            .join(format!("{}_{tag}.safetensors", timestamp()?));
        let _guard = tch::no_grad_guard();
        let cpu_vars: Vec<(&str, Tensor)> = vars
            .iter()
            .map(|(name, tensor)| (name.as_str(), tensor.detach().to_device(Device::Cpu)))
            .collect();
        Tensor::write_safetensors(&cpu_vars, &path)?;
        Ok(path)
    }
}

fn timestamp() -> Result<String, time::error::Format> {
    OffsetDateTime::now_utc().format(format_description!(
        "[year]-[month]-[day]_[hour]-[minute]-[second]"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Kind};

    fn some_vars() -> (nn::VarStore, Vec<(String, Tensor)>) {
        let vs = nn::VarStore::new(Device::Cpu);
        let a = vs.root().sub("encoder").var("weight", &[2, 2], nn::Init::Const(0.5));
        let b = vs.root().var("temperature", &[1], nn::Init::Const(1.0));
        (
            vs,
            vec![
                ("encoder.weight".to_string(), a),
                ("temperature".to_string(), b),
            ],
        )
    }

    #[test]
    fn test_step_trigger() {
        let checkpointer = Checkpointer::new(Path::new("unused"), 4, 1);
        assert!(!checkpointer.should_save_step(0));
        assert!(!checkpointer.should_save_step(3));
        assert!(checkpointer.should_save_step(4));
        assert!(checkpointer.should_save_step(8));
    }

    #[test]
    fn test_epoch_trigger() {
        let checkpointer = Checkpointer::new(Path::new("unused"), 4, 2);
        assert!(checkpointer.should_save_epoch(0));
        assert!(!checkpointer.should_save_epoch(1));
        assert!(checkpointer.should_save_epoch(2));
    }

    #[test]
    fn test_tag_formatting_is_zero_padded() {
        assert_eq!(CheckpointTag::Step(42).to_string(), "step00000042");
        assert_eq!(CheckpointTag::Epoch(7).to_string(), "epoch007");
    }

    #[test]
    fn test_distinct_tags_never_share_a_path() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path(), 1, 1);
        let (_vs, vars) = some_vars();

        let mut paths = vec![
            checkpointer.save(&vars, CheckpointTag::Step(1)).unwrap(),
            checkpointer.save(&vars, CheckpointTag::Step(2)).unwrap(),
            checkpointer.save(&vars, CheckpointTag::Epoch(0)).unwrap(),
            checkpointer.save(&vars, CheckpointTag::Epoch(1)).unwrap(),
        ];
        let before = paths.len();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), before);
    }

    #[test]
    fn test_saved_checkpoint_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path(), 1, 1);
        let (_vs, vars) = some_vars();

        let path = checkpointer.save(&vars, CheckpointTag::Step(5)).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().contains("step00000005"));

        let restored = Tensor::read_safetensors(&path).unwrap();
        let mut names: Vec<String> = restored.iter().map(|(n, _)| n.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["encoder.weight", "temperature"]);
        let weight = &restored.iter().find(|(n, _)| n == "encoder.weight").unwrap().1;
        assert_eq!(weight.sum(Kind::Float).double_value(&[]), 2.0);
    }
}
