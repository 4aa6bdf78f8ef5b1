//! Tensor-level glue over the process group.
//!
//! Device tensors hop through host `f32` buffers for reduction; reductions
//! themselves are carried out by `clasp-collective`. Collective calls are
//! position-sensitive, so anything iterating variables here must use the
//! stable name-sorted order from [`crate::stable_variables`].

use std::sync::Arc;

use clasp_collective::{CollectiveError, ProcessGroup, ReduceOp};
use tch::{Device, Kind, TchError, Tensor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Collective(#[from] CollectiveError),

    #[error("tensor transfer failed: {0}")]
    Torch(#[from] TchError),
}

/// A rank's handle on the data-parallel group.
///
/// Thin wrapper so modeling code never touches raw sockets; `None` in the
/// `Option<Arc<Communicator>>` passed around the trainer means "single
/// replica, collectives are the identity".
#[derive(Debug)]
pub struct Communicator {
    group: ProcessGroup,
}

impl Communicator {
    pub fn new(group: ProcessGroup) -> Self {
        Self { group }
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    pub fn barrier(&self) -> Result<(), CollectiveError> {
        self.group.barrier()
    }

    pub fn all_reduce_scalar(&self, value: f64, op: ReduceOp) -> Result<f64, CollectiveError> {
        self.group.all_reduce_scalar(value, op)
    }

    pub fn all_reduce(&self, data: &mut [f32], op: ReduceOp) -> Result<(), CollectiveError> {
        self.group.all_reduce(data, op)
    }

    pub fn all_gather(&self, data: &[f32]) -> Result<Vec<f32>, CollectiveError> {
        self.group.all_gather(data)
    }

    /// Tear the group down; exactly once per process, on every exit path.
    pub fn cleanup(&self) -> Result<(), CollectiveError> {
        self.group.cleanup()
    }
}

pub trait AllReduce {
    fn all_reduce(
        &mut self,
        comm: &Option<Arc<Communicator>>,
        op: ReduceOp,
    ) -> Result<(), SyncError>;
}

impl AllReduce for Tensor {
    fn all_reduce(
        &mut self,
        comm: &Option<Arc<Communicator>>,
        op: ReduceOp,
    ) -> Result<(), SyncError> {
        let Some(comm) = comm else {
            return Ok(());
        };
        let size = self.size();
        let device = self.device();
        let kind = self.kind();
        let flat = self
            .detach()
            .to_kind(Kind::Float)
            .flatten(0, -1)
            .to_device(Device::Cpu);
        let mut values = Vec::<f32>::try_from(&flat)?;
        comm.all_reduce(&mut values, op)?;
        let reduced = Tensor::from_slice(&values)
            .reshape(size.as_slice())
            .to_kind(kind)
            .to_device(device);
        let _ = self.copy_(&reduced);
        Ok(())
    }
}

/// Average every defined gradient across the data-parallel group, in place.
///
/// This is the replica layer's contract: gradients computed locally are
/// averaged across all ranks before the optimizer consumes them. Reduction
/// happens in fp32 regardless of the parameter kind. `vars` must be the
/// name-sorted list so all ranks reduce in the same order.
pub fn sync_gradients(
    vars: &[(String, Tensor)],
    comm: &Option<Arc<Communicator>>,
) -> Result<(), SyncError> {
    if comm.is_none() {
        return Ok(());
    }
    for (_, var) in vars {
        let mut grad = var.grad();
        if grad.defined() {
            let mut fp32 = grad.to_kind(Kind::Float);
            fp32.all_reduce(comm, ReduceOp::Mean)?;
            let _ = grad.copy_(&fp32.to_kind(grad.kind()));
        }
    }
    Ok(())
}

/// Cross-rank mean of a scalar already materialized on this rank: the
/// metric reducer for loss and timing values.
pub fn reduce_mean_scalar(
    value: f64,
    comm: &Option<Arc<Communicator>>,
) -> Result<f64, SyncError> {
    match comm {
        Some(comm) => Ok(comm.all_reduce_scalar(value, ReduceOp::Mean)?),
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_reduce_without_comm_is_identity() {
        let mut t = Tensor::from_slice(&[1.0f32, 2.0, 3.0]);
        t.all_reduce(&None, ReduceOp::Mean).unwrap();
        let values = Vec::<f32>::try_from(&t).unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_reduce_mean_scalar_without_comm_is_identity() {
        assert_eq!(reduce_mean_scalar(2.25, &None).unwrap(), 2.25);
    }
}
