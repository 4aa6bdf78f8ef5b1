mod meter;
mod role;
mod run;

pub use meter::AverageMeter;
pub use role::Role;
pub use run::{ModelDims, ModelFlags, RunConfig, RunPaths, WorkerId};
