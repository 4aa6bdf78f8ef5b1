mod checkpoint;
mod contrastive;
mod data;
mod device_utils;
pub mod metrics;
mod models;
mod optimizer;
mod parallelism;
mod profiler;
mod tokenizer;
mod trainer;
mod variables;

pub use checkpoint::{CheckpointError, CheckpointTag, Checkpointer};
pub use contrastive::{ContrastiveModel, ForwardFlags};
pub use data::{
    BatchProvider, DataError, SafetensorsShard, SyntheticShard, VisionTextBatch, DATA_EPOCH_ENV,
};
pub use device_utils::{get_optimal_devices, Devices, DevicesParseError};
pub use metrics::{load_scalars, MetricsWriter, ScalarRecord};
pub use models::{Clip, ModelError};
pub use optimizer::{clip_global_grad_norm, grad_norm_sum, AdamW};
pub use parallelism::{reduce_mean_scalar, sync_gradients, AllReduce, Communicator, SyncError};
pub use profiler::{ProfileSchedule, ProfilerError, ProfilerPhase, StepProfiler};
pub use tokenizer::Tokenizer;
pub use trainer::{CoordinatorIo, EpochRunner, EpochSummary, TrainError};
pub use variables::stable_variables;
