//! Collective communication for single-node data-parallel training.
//!
//! One process per device, all on the same host. Rank 0 doubles as the
//! rendezvous hub: it binds the coordinator address, every other rank
//! connects to it, and reductions flow hub-and-spoke. Every collective
//! blocks until all ranks arrive, and all ranks must issue collective
//! calls in the same relative order; a rank skipping a call deadlocks
//! the rest of the group.

mod group;
mod wire;

pub use group::{
    coordinator_addr_from_env, ProcessGroup, ReduceOp, COORD_ADDR_ENV, COORD_PORT_ENV,
    DEFAULT_COORD_ADDR, DEFAULT_COORD_PORT,
};
pub use wire::CollectiveError;
