mod clip;

pub use clip::{Clip, ModelError};
